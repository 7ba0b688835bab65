//! Reference implementations the suites are run against.
//!
//! The correct ones must come out conformant. Each flaw breaks one rule, so
//! the suites are shown to notice it.

use std::{collections::VecDeque, sync::Arc, thread, time::Duration};

use flowcheck_core::{EnvironmentConfig, SubscriberPuppet, TestEnvironment, WhiteboxSubscriberProbe};
use flowcheck_harness::{
    BlackboxSubscriberFactory, ProcessorFactory, PublisherCapabilities, PublisherFactory,
    TestSignalError, WhiteboxSubscriberFactory, processor::PROCESSOR_STOCHASTIC_REPETITIONS,
};
use flowcheck_proto::{
    MAX_DEMAND, NonPositiveRequest, Processor, Publisher, SignalError, Subscriber, Subscription,
    add_demand,
};
use parking_lot::Mutex;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Short timeouts so whole suites finish in seconds.
pub fn env() -> Arc<TestEnvironment> {
    init_tracing();
    TestEnvironment::new(
        EnvironmentConfig::default()
            .with_default_timeout(Duration::from_millis(300))
            .with_no_signals_timeout(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(5))
            .with_publisher_reference_gc_timeout(Duration::from_millis(300)),
    )
}

/// Log through the test writer, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(filter)
        .try_init();
}

/// Subscription that ignores everything.
struct Inert;

impl Subscription for Inert {
    fn request(&self, _n: i64) {}

    fn cancel(&self) {}
}

/// Rejects every subscriber right after `on_subscribe`.
pub struct FailedPublisher;

impl<T> Publisher<T> for FailedPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Arc::new(Inert));
        subscriber.on_error(TestSignalError::signal());
    }
}

// Publisher

/// Deliberate defects of [`RangePublisher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherFlaw {
    /// Correct.
    None,
    /// `request(n <= 0)` is silently dropped.
    IgnoresIllegalRequests,
    /// Emits everything right after `on_subscribe`, demand or not.
    EmitsWithoutDemand,
    /// Holds on to every subscriber forever.
    KeepsCancelledSubscribers,
    /// Emits straight from `request`, even when called from inside `on_next`.
    RecursesWithoutGuard,
    /// Signals `on_error` once pending demand would pass `MAX_DEMAND`.
    OverflowsDemand,
    /// Emits from a fresh thread on every `request` and waits for it, so
    /// signals overlap with the caller's.
    SignalsConcurrently,
}

/// Cold publisher of `0..elements`, emitting synchronously on whichever
/// thread signals demand.
pub struct RangePublisher {
    elements: u64,
    flaw: PublisherFlaw,
    retained: Mutex<Vec<Arc<dyn Subscriber<u64>>>>,
}

impl RangePublisher {
    pub fn new(elements: u64, flaw: PublisherFlaw) -> Arc<Self> {
        Arc::new(Self { elements, flaw, retained: Mutex::new(Vec::new()) })
    }
}

#[derive(Default)]
struct RangeState {
    demand: i64,
    emitted: u64,
    emitting: bool,
    terminated: bool,
    illegal: Option<i64>,
    overflowed: bool,
}

enum Step {
    Next(u64),
    Complete,
    Reject(i64),
    Overflow,
    Idle,
}

struct RangeSubscription {
    elements: u64,
    flaw: PublisherFlaw,
    state: Mutex<RangeState>,
    subscriber: Mutex<Option<Arc<dyn Subscriber<u64>>>>,
}

impl RangeSubscription {
    fn next_step(&self) -> Step {
        let mut state = self.state.lock();
        if state.terminated {
            state.emitting = false;
            return Step::Idle;
        }
        if let Some(requested) = state.illegal.take() {
            state.terminated = true;
            return Step::Reject(requested);
        }
        if state.overflowed {
            state.terminated = true;
            return Step::Overflow;
        }
        if state.emitted == self.elements {
            state.terminated = true;
            return Step::Complete;
        }
        if state.demand > 0 || self.flaw == PublisherFlaw::EmitsWithoutDemand {
            if state.demand > 0 && state.demand != MAX_DEMAND {
                state.demand -= 1;
            }
            let id = state.emitted;
            state.emitted += 1;
            return Step::Next(id);
        }
        state.emitting = false;
        Step::Idle
    }

    /// Emit until demand runs out. The caller owns the `emitting` flag, so
    /// requests from inside `on_next` only add demand and return.
    fn emit_loop(&self) {
        loop {
            match self.next_step() {
                Step::Next(id) => {
                    let subscriber = self.subscriber.lock().clone();
                    if let Some(subscriber) = subscriber {
                        subscriber.on_next(id);
                    }
                },
                Step::Complete => {
                    let subscriber = self.subscriber.lock().take();
                    if let Some(subscriber) = subscriber {
                        subscriber.on_complete();
                    }
                },
                Step::Reject(requested) => {
                    let subscriber = self.subscriber.lock().take();
                    if let Some(subscriber) = subscriber {
                        subscriber.on_error(NonPositiveRequest::signal(requested));
                    }
                },
                Step::Overflow => {
                    let subscriber = self.subscriber.lock().take();
                    if let Some(subscriber) = subscriber {
                        subscriber.on_error(TestSignalError::signal());
                    }
                },
                Step::Idle => return,
            }
        }
    }

    fn drain(&self) {
        {
            let mut state = self.state.lock();
            if state.emitting {
                return;
            }
            state.emitting = true;
        }
        self.emit_loop();
    }
}

impl Subscription for RangeSubscription {
    fn request(&self, n: i64) {
        {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }
            if n <= 0 {
                if self.flaw == PublisherFlaw::IgnoresIllegalRequests {
                    return;
                }
                if state.illegal.is_none() {
                    state.illegal = Some(n);
                }
            } else if self.flaw == PublisherFlaw::OverflowsDemand {
                match state.demand.checked_add(n) {
                    Some(demand) => state.demand = demand,
                    None => state.overflowed = true,
                }
            } else {
                state.demand = add_demand(state.demand, n);
            }
        }
        match self.flaw {
            PublisherFlaw::RecursesWithoutGuard => self.emit_loop(),
            PublisherFlaw::SignalsConcurrently => thread::scope(|scope| {
                scope.spawn(|| self.emit_loop());
            }),
            _ => self.drain(),
        }
    }

    fn cancel(&self) {
        self.state.lock().terminated = true;
        drop(self.subscriber.lock().take());
    }
}

impl Publisher<u64> for RangePublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<u64>>) {
        if self.flaw == PublisherFlaw::KeepsCancelledSubscribers {
            self.retained.lock().push(Arc::clone(&subscriber));
        }
        let subscription = Arc::new(RangeSubscription {
            elements: self.elements,
            flaw: self.flaw,
            state: Mutex::new(RangeState { emitting: true, ..RangeState::default() }),
            subscriber: Mutex::new(Some(Arc::clone(&subscriber))),
        });
        subscriber.on_subscribe(subscription.clone());
        subscription.emit_loop();
    }
}

/// Factory for [`RangePublisher`]s.
pub struct RangePublishers {
    pub flaw: PublisherFlaw,
    pub with_failed_publisher: bool,
}

impl RangePublishers {
    pub fn correct() -> Arc<Self> {
        Self::flawed(PublisherFlaw::None)
    }

    pub fn flawed(flaw: PublisherFlaw) -> Arc<Self> {
        Arc::new(Self { flaw, with_failed_publisher: true })
    }
}

impl PublisherFactory<u64> for RangePublishers {
    fn create_publisher(&self, elements: u64) -> Arc<dyn Publisher<u64>> {
        RangePublisher::new(elements, self.flaw)
    }

    fn create_failed_publisher(&self) -> Option<Arc<dyn Publisher<u64>>> {
        self.with_failed_publisher.then(|| Arc::new(FailedPublisher) as Arc<dyn Publisher<u64>>)
    }

    fn capabilities(&self) -> PublisherCapabilities {
        PublisherCapabilities::default().with_max_supported_subscribers(3)
    }
}

// Subscribers

/// Deliberate defects of the reference subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberFlaw {
    /// Correct.
    None,
    /// Calls `cancel` from inside `on_complete`.
    CancelsOnComplete,
    /// Leaves a second subscription alone instead of cancelling it.
    KeepsSecondSubscription,
}

/// Subscription state shared by both reference subscribers.
struct Held {
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    flaw: SubscriberFlaw,
}

impl Held {
    fn new(flaw: SubscriberFlaw) -> Self {
        Self { subscription: Mutex::new(None), flaw }
    }

    /// Keep `subscription` if it is the first one. Returns false otherwise.
    fn accept(&self, subscription: &Arc<dyn Subscription>) -> bool {
        let mut held = self.subscription.lock();
        if held.is_some() {
            drop(held);
            if self.flaw != SubscriberFlaw::KeepsSecondSubscription {
                subscription.cancel();
            }
            return false;
        }
        *held = Some(Arc::clone(subscription));
        true
    }

    fn current(&self) -> Option<Arc<dyn Subscription>> {
        self.subscription.lock().clone()
    }

    fn completed(&self) {
        if self.flaw == SubscriberFlaw::CancelsOnComplete {
            if let Some(subscription) = self.current() {
                subscription.cancel();
            }
        }
    }
}

struct SubscriptionPuppet(Arc<dyn Subscription>);

impl SubscriberPuppet for SubscriptionPuppet {
    fn trigger_request(&self, n: i64) {
        self.0.request(n);
    }

    fn signal_cancel(&self) {
        self.0.cancel();
    }
}

/// Subscriber that only acts through the puppet it registers.
pub struct ProbedSubscriber {
    probe: Arc<WhiteboxSubscriberProbe<u64>>,
    held: Held,
}

impl Subscriber<u64> for ProbedSubscriber {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.held.accept(&subscription) {
            self.probe.register_on_subscribe(Arc::new(SubscriptionPuppet(subscription)));
        }
    }

    fn on_next(&self, element: u64) {
        self.probe.register_on_next(element);
    }

    fn on_error(&self, error: SignalError) {
        self.probe.register_on_error(error);
    }

    fn on_complete(&self) {
        self.probe.register_on_complete();
        self.held.completed();
    }
}

/// Factory for [`ProbedSubscriber`]s.
pub struct ProbedSubscribers(pub SubscriberFlaw);

impl WhiteboxSubscriberFactory<u64> for ProbedSubscribers {
    fn create_subscriber(
        &self,
        probe: Arc<WhiteboxSubscriberProbe<u64>>,
    ) -> Arc<dyn Subscriber<u64>> {
        Arc::new(ProbedSubscriber { probe, held: Held::new(self.0) })
    }

    fn create_element(&self, id: u64) -> u64 {
        id
    }
}

/// Subscriber that requests one element up front and one per element.
pub struct PullingSubscriber {
    held: Held,
}

impl Subscriber<u64> for PullingSubscriber {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.held.accept(&subscription) {
            subscription.request(1);
        }
    }

    fn on_next(&self, _element: u64) {
        if let Some(subscription) = self.held.current() {
            subscription.request(1);
        }
    }

    fn on_error(&self, _error: SignalError) {}

    fn on_complete(&self) {
        self.held.completed();
    }
}

/// Factory for [`PullingSubscriber`]s.
pub struct PullingSubscribers(pub SubscriberFlaw);

impl BlackboxSubscriberFactory<u64> for PullingSubscribers {
    fn create_subscriber(&self) -> Arc<dyn Subscriber<u64>> {
        Arc::new(PullingSubscriber { held: Held::new(self.0) })
    }

    fn create_element(&self, id: u64) -> u64 {
        id
    }
}

// Processor

enum Terminal {
    Completed,
    Failed(SignalError),
}

struct Downstream<T> {
    id: u64,
    subscriber: Arc<dyn Subscriber<T>>,
    /// Stream index of the next element this subscriber gets.
    cursor: u64,
    demand: i64,
    /// False until `on_subscribe` returned.
    active: bool,
    illegal: Option<i64>,
}

enum Emission<T> {
    Next(Arc<dyn Subscriber<T>>, T),
    Complete(Arc<dyn Subscriber<T>>),
    Error(Arc<dyn Subscriber<T>>, SignalError),
}

struct HubState<T> {
    upstream: Option<Arc<dyn Subscription>>,
    upstream_cancelled: bool,
    requested: u64,
    /// Elements from stream index `base` on, kept until every subscriber
    /// has passed them.
    buffer: VecDeque<T>,
    base: u64,
    terminal: Option<Terminal>,
    downstreams: Vec<Downstream<T>>,
    next_id: u64,
    emitting: bool,
    /// Upstream errors reach only the first subscriber; the rest are dropped.
    errors_first_only: bool,
}

impl<T: Clone> HubState<T> {
    fn received(&self) -> u64 {
        self.base + self.buffer.len() as u64
    }

    fn trim(&mut self) {
        let received = self.received();
        let oldest = self.downstreams.iter().map(|d| d.cursor).min().unwrap_or(received);
        while self.base < oldest && self.buffer.pop_front().is_some() {
            self.base += 1;
        }
    }

    fn next_emission(&mut self) -> Option<Emission<T>> {
        self.trim();
        let received = self.received();
        for i in 0..self.downstreams.len() {
            let d = &mut self.downstreams[i];
            if !d.active {
                continue;
            }
            if let Some(requested) = d.illegal {
                let d = self.downstreams.remove(i);
                return Some(Emission::Error(d.subscriber, NonPositiveRequest::signal(requested)));
            }
            if let Some(Terminal::Failed(cause)) = &self.terminal {
                let cause = Arc::clone(cause);
                let d = self.downstreams.remove(i);
                if self.errors_first_only {
                    self.downstreams.clear();
                }
                return Some(Emission::Error(d.subscriber, cause));
            }
            if d.cursor < received && d.demand > 0 {
                let element = self.buffer[(d.cursor - self.base) as usize].clone();
                d.cursor += 1;
                if d.demand != MAX_DEMAND {
                    d.demand -= 1;
                }
                return Some(Emission::Next(Arc::clone(&d.subscriber), element));
            }
            if d.cursor == received && matches!(self.terminal, Some(Terminal::Completed)) {
                let d = self.downstreams.remove(i);
                return Some(Emission::Complete(d.subscriber));
            }
        }
        None
    }

    /// Upstream demand needed so the most eager subscriber can be served.
    fn upstream_delta(&mut self) -> Option<(Arc<dyn Subscription>, i64)> {
        if self.terminal.is_some() || self.upstream_cancelled {
            return None;
        }
        let upstream = self.upstream.clone()?;
        let target = self
            .downstreams
            .iter()
            .map(|d| d.cursor.saturating_add(d.demand.max(0) as u64))
            .max()?;
        if target <= self.requested {
            return None;
        }
        let delta = (target - self.requested).min(MAX_DEMAND as u64);
        self.requested = self.requested.saturating_add(delta);
        Some((upstream, delta as i64))
    }
}

struct Hub<T> {
    state: Mutex<HubState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Hub<T> {
    fn drain(&self) {
        {
            let mut state = self.state.lock();
            if state.emitting {
                return;
            }
            state.emitting = true;
        }
        loop {
            let emission = {
                let mut state = self.state.lock();
                let emission = state.next_emission();
                if emission.is_none() {
                    state.emitting = false;
                }
                emission
            };
            match emission {
                Some(Emission::Next(subscriber, element)) => subscriber.on_next(element),
                Some(Emission::Complete(subscriber)) => subscriber.on_complete(),
                Some(Emission::Error(subscriber, cause)) => subscriber.on_error(cause),
                None => return,
            }
        }
    }

    fn request(&self, id: u64, n: i64) {
        let pending = {
            let mut state = self.state.lock();
            let Some(d) = state.downstreams.iter_mut().find(|d| d.id == id) else {
                return;
            };
            if n <= 0 {
                if d.illegal.is_none() {
                    d.illegal = Some(n);
                }
                None
            } else {
                d.demand = add_demand(d.demand, n);
                state.upstream_delta()
            }
        };
        if let Some((upstream, delta)) = pending {
            upstream.request(delta);
        }
        self.drain();
    }

    fn cancel(&self, id: u64) {
        let (removed, upstream) = {
            let mut state = self.state.lock();
            let Some(index) = state.downstreams.iter().position(|d| d.id == id) else {
                return;
            };
            let removed = state.downstreams.remove(index);
            let last = state.downstreams.is_empty()
                && state.terminal.is_none()
                && !state.upstream_cancelled;
            if last {
                state.upstream_cancelled = true;
            }
            (removed, if last { state.upstream.clone() } else { None })
        };
        drop(removed);
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

struct HubSubscription<T> {
    hub: Arc<Hub<T>>,
    id: u64,
}

impl<T: Clone + Send + Sync + 'static> Subscription for HubSubscription<T> {
    fn request(&self, n: i64) {
        self.hub.request(self.id, n);
    }

    fn cancel(&self) {
        self.hub.cancel(self.id);
    }
}

/// Identity processor broadcasting to any number of subscribers.
///
/// Upstream demand follows the most eager subscriber. Elements are kept for
/// slower subscribers, and a subscriber joining late starts at the next
/// element to arrive.
pub struct MulticastProcessor<T> {
    hub: Arc<Hub<T>>,
}

impl<T: Clone + Send + Sync + 'static> MulticastProcessor<T> {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// A processor that forwards an upstream error to its first subscriber
    /// only.
    pub fn erroring_first_subscriber_only() -> Arc<Self> {
        Self::build(true)
    }

    fn build(errors_first_only: bool) -> Arc<Self> {
        Arc::new(Self {
            hub: Arc::new(Hub {
                state: Mutex::new(HubState {
                    upstream: None,
                    upstream_cancelled: false,
                    requested: 0,
                    buffer: VecDeque::new(),
                    base: 0,
                    terminal: None,
                    downstreams: Vec::new(),
                    next_id: 0,
                    emitting: false,
                    errors_first_only,
                }),
            }),
        })
    }

    fn terminate(&self, terminal: Terminal) {
        {
            let mut state = self.hub.state.lock();
            if state.terminal.is_none() {
                state.terminal = Some(terminal);
            }
        }
        self.hub.drain();
    }
}

impl<T: Clone + Send + Sync + 'static> Subscriber<T> for MulticastProcessor<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let mut state = self.hub.state.lock();
        if state.upstream.is_some() || state.upstream_cancelled {
            drop(state);
            subscription.cancel();
            return;
        }
        state.upstream = Some(subscription);
        let pending = state.upstream_delta();
        drop(state);
        if let Some((upstream, delta)) = pending {
            upstream.request(delta);
        }
    }

    fn on_next(&self, element: T) {
        {
            let mut state = self.hub.state.lock();
            if state.terminal.is_some() || state.upstream_cancelled {
                return;
            }
            state.buffer.push_back(element);
        }
        self.hub.drain();
    }

    fn on_error(&self, error: SignalError) {
        self.terminate(Terminal::Failed(error));
    }

    fn on_complete(&self) {
        self.terminate(Terminal::Completed);
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for MulticastProcessor<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let id = {
            let mut state = self.hub.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let cursor = state.received();
            state.downstreams.push(Downstream {
                id,
                subscriber: Arc::clone(&subscriber),
                cursor,
                demand: 0,
                active: false,
                illegal: None,
            });
            id
        };
        subscriber.on_subscribe(Arc::new(HubSubscription { hub: Arc::clone(&self.hub), id }));

        if let Some(d) = self.hub.state.lock().downstreams.iter_mut().find(|d| d.id == id) {
            d.active = true;
        }
        self.hub.drain();
    }
}

/// Factory for [`MulticastProcessor`]s over `u64`.
pub struct MulticastProcessors;

impl ProcessorFactory<u64> for MulticastProcessors {
    fn create_identity_processor(&self, _buffer_size: usize) -> Arc<dyn Processor<u64>> {
        MulticastProcessor::<u64>::new()
    }

    fn create_failed_publisher(&self) -> Option<Arc<dyn Publisher<u64>>> {
        Some(Arc::new(FailedPublisher))
    }

    fn create_element(&self, id: u64) -> u64 {
        id
    }

    fn capabilities(&self) -> PublisherCapabilities {
        PublisherCapabilities::default()
            .with_stochastic_repetitions(PROCESSOR_STOCHASTIC_REPETITIONS)
            .with_max_supported_subscribers(2)
    }
}

/// Factory for processors that strand all but the first subscriber on error.
pub struct PartialErrorProcessors;

impl ProcessorFactory<u64> for PartialErrorProcessors {
    fn create_identity_processor(&self, _buffer_size: usize) -> Arc<dyn Processor<u64>> {
        MulticastProcessor::<u64>::erroring_first_subscriber_only()
    }

    fn create_element(&self, id: u64) -> u64 {
        id
    }

    fn capabilities(&self) -> PublisherCapabilities {
        PublisherCapabilities::default().with_max_supported_subscribers(2)
    }
}
