//! Purpose-built subscribers the publisher rules attach to the publisher
//! under test.
//!
//! Each one does the minimum its rule needs and records everything else as a
//! flop, so a misbehaving publisher never sees a panic on its own thread.

use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use flowcheck_core::{
    ConcurrentAccessBarrier, Element, Latch, Promise, Signal, TestEnvironment,
};
use flowcheck_proto::{SignalError, Subscriber, Subscription};
use parking_lot::Mutex;

/// Checks that `on_subscribe` comes first and at most once.
///
/// With `error_expected` the subscriber is attached to a failed publisher:
/// `on_error` must arrive exactly once and nothing else may.
pub(super) struct OrderingSubscriber<T> {
    env: Arc<TestEnvironment>,
    pub(super) subscribed: Latch,
    pub(super) errored: Latch,
    error_expected: bool,
    _element: PhantomData<fn(T)>,
}

impl<T: Element> OrderingSubscriber<T> {
    pub(super) fn new(env: Arc<TestEnvironment>, error_expected: bool) -> Arc<Self> {
        Arc::new(Self {
            subscribed: Latch::new(Arc::clone(&env)),
            errored: Latch::new(Arc::clone(&env)),
            env,
            error_expected,
            _element: PhantomData,
        })
    }
}

impl<T: Element> Subscriber<T> for OrderingSubscriber<T> {
    fn on_subscribe(&self, _subscription: Arc<dyn Subscription>) {
        self.subscribed.assert_open("expected on_subscribe to be called only once");
        self.subscribed.close();
    }

    fn on_next(&self, element: T) {
        self.subscribed.assert_closed("on_subscribe should be called prior to on_next always");
        if self.error_expected {
            self.env.flop(format!(
                "unexpected subscriber::on_next({element:?}) from a failed publisher"
            ));
        }
    }

    fn on_error(&self, error: SignalError) {
        self.subscribed.assert_closed("on_subscribe should be called prior to on_error always");
        if self.error_expected {
            self.errored.assert_open("failed publisher called on_error twice on new subscriber");
            self.errored.close();
        } else {
            self.env.flop_signal(error, "unexpected subscriber::on_error");
        }
    }

    fn on_complete(&self) {
        self.subscribed.assert_closed("on_subscribe should be called prior to on_complete always");
        if self.error_expected {
            self.env.flop("unexpected subscriber::on_complete from a failed publisher");
        }
    }
}

/// Requests one element at a time from inside its own callbacks, behind a
/// [`ConcurrentAccessBarrier`], until the stream completes.
pub(super) struct SequentialSubscriber<T> {
    env: Arc<TestEnvironment>,
    barrier: ConcurrentAccessBarrier,
    subscription: Promise<Arc<dyn Subscription>>,
    pub(super) received: AtomicU64,
    pub(super) completed: Latch,
    elements: u64,
    _element: PhantomData<fn(T)>,
}

impl<T: Element> SequentialSubscriber<T> {
    pub(super) fn new(env: Arc<TestEnvironment>, elements: u64) -> Arc<Self> {
        Arc::new(Self {
            barrier: ConcurrentAccessBarrier::new(Arc::clone(&env)),
            subscription: Promise::new(Arc::clone(&env)),
            received: AtomicU64::new(0),
            completed: Latch::new(Arc::clone(&env)),
            env,
            elements,
            _element: PhantomData,
        })
    }

    fn request_one(&self) {
        if let Some(subscription) = self.subscription.try_value() {
            subscription.request(1);
        }
    }
}

impl<T: Element> Subscriber<T> for SequentialSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.barrier.enter(Signal::OnSubscribe);
        self.subscription.complete(subscription);
        self.request_one();
        self.barrier.leave();
    }

    fn on_next(&self, _element: T) {
        self.barrier.enter(Signal::OnNext);
        if self.received.fetch_add(1, Ordering::AcqRel) < self.elements {
            self.request_one();
        }
        self.barrier.leave();
    }

    fn on_error(&self, error: SignalError) {
        self.barrier.enter(Signal::OnError);
        self.env.flop_signal(error, "unexpected subscriber::on_error");
        self.barrier.leave();
    }

    fn on_complete(&self) {
        self.barrier.enter(Signal::OnComplete);
        self.completed.close();
        self.barrier.leave();
    }
}

/// Calls `request` synchronously from `on_subscribe` (three times) and from
/// every `on_next`.
pub(super) struct EagerRequester<T> {
    env: Arc<TestEnvironment>,
    subscription: Promise<Arc<dyn Subscription>>,
    pub(super) subscribed: Latch,
    _element: PhantomData<fn(T)>,
}

impl<T: Element> EagerRequester<T> {
    pub(super) fn new(env: Arc<TestEnvironment>) -> Arc<Self> {
        Arc::new(Self {
            subscription: Promise::new(Arc::clone(&env)),
            subscribed: Latch::new(Arc::clone(&env)),
            env,
            _element: PhantomData,
        })
    }

    pub(super) fn cancel(&self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }
}

impl<T: Element> Subscriber<T> for EagerRequester<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.subscription.complete(Arc::clone(&subscription));
        self.subscribed.close();
        subscription.request(1);
        subscription.request(1);
        subscription.request(1);
    }

    fn on_next(&self, _element: T) {
        if let Some(subscription) = self.subscription.try_value() {
            subscription.request(1);
        }
    }

    fn on_error(&self, error: SignalError) {
        self.env.flop_signal(error, "unexpected subscriber::on_error");
    }

    fn on_complete(&self) {}
}

/// Measures how deep `request -> on_next -> request` recursion goes on each
/// thread.
///
/// Every `on_next` requests one more element right away; the publisher must
/// break the chain before the per-thread depth exceeds `bound`.
pub(super) struct RecursionProbe<T> {
    env: Arc<TestEnvironment>,
    subscription: Promise<Arc<dyn Subscription>>,
    depth: Mutex<HashMap<ThreadId, u64>>,
    signals: AtomicU64,
    bound: u64,
    limit: u64,
    pub(super) finished: Latch,
    _element: PhantomData<fn(T)>,
}

impl<T: Element> RecursionProbe<T> {
    pub(super) fn new(env: Arc<TestEnvironment>, bound: u64) -> Arc<Self> {
        Arc::new(Self {
            subscription: Promise::new(Arc::clone(&env)),
            depth: Mutex::new(HashMap::new()),
            signals: AtomicU64::new(0),
            bound,
            limit: bound.saturating_add(1),
            finished: Latch::new(Arc::clone(&env)),
            env,
            _element: PhantomData,
        })
    }

    pub(super) fn subscription(&self) -> &Promise<Arc<dyn Subscription>> {
        &self.subscription
    }

    fn adjust_depth(&self, enter: bool) -> u64 {
        let mut depth = self.depth.lock();
        let slot = depth.entry(thread::current().id()).or_insert(0);
        if enter {
            *slot += 1;
        } else {
            *slot = slot.saturating_sub(1);
        }
        *slot
    }
}

impl<T: Element> Subscriber<T> for RecursionProbe<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.subscription.complete(subscription);
    }

    fn on_next(&self, _element: T) {
        let signals = self.signals.fetch_add(1, Ordering::AcqRel) + 1;
        let depth = self.adjust_depth(true);
        self.env.debug(format!("recursion probe: on_next #{signals} at depth {depth}"));

        if depth > self.bound {
            self.env.flop(format!(
                "got {depth} on_next calls within thread {:?}, yet expected recursive bound was {}",
                thread::current().id(),
                self.bound
            ));
            self.finished.close();
            return;
        }
        if signals >= self.limit {
            self.finished.close();
            return;
        }

        if let Some(subscription) = self.subscription.try_value() {
            subscription.request(1);
        }
        self.adjust_depth(false);
    }

    fn on_error(&self, error: SignalError) {
        self.env.flop_signal(error, "unexpected subscriber::on_error");
        self.finished.close();
    }

    fn on_complete(&self) {
        self.finished.close();
    }
}

/// Pushes demand past [`flowcheck_proto::MAX_DEMAND`] by requesting
/// `MAX_DEMAND - 1` from a bounded number of `on_next` calls, then cancels.
pub(super) struct OverflowingSubscriber<T> {
    env: Arc<TestEnvironment>,
    subscription: Promise<Arc<dyn Subscription>>,
    remaining_calls: AtomicI64,
    _element: PhantomData<fn(T)>,
}

impl<T: Element> OverflowingSubscriber<T> {
    pub(super) fn new(env: Arc<TestEnvironment>, calls: i64) -> Arc<Self> {
        Arc::new(Self {
            subscription: Promise::new(Arc::clone(&env)),
            remaining_calls: AtomicI64::new(calls),
            env,
            _element: PhantomData,
        })
    }

    pub(super) fn subscription(&self) -> &Promise<Arc<dyn Subscription>> {
        &self.subscription
    }
}

impl<T: Element> Subscriber<T> for OverflowingSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.subscription.complete(subscription);
    }

    fn on_next(&self, _element: T) {
        let Some(subscription) = self.subscription.try_value() else {
            return;
        };
        if self.remaining_calls.fetch_sub(1, Ordering::AcqRel) > 0 {
            subscription.request(flowcheck_proto::MAX_DEMAND - 1);
        } else {
            subscription.cancel();
        }
    }

    fn on_error(&self, error: SignalError) {
        self.env.flop_signal(error, "unexpected subscriber::on_error while demand overflowed");
    }

    fn on_complete(&self) {}
}
