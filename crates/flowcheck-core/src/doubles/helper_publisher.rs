//! Background element generator.
//!
//! A plain, correct publisher used wherever a scenario needs a source of
//! elements but is not testing the source itself: feeding a processor under
//! test, or giving a subscriber-under-test stage its payloads.
//!
//! Each subscription gets one worker thread that waits on a condition
//! variable for demand and emits `factory(0)`, `factory(1)`, ... until the
//! element count is exhausted, the subscription is cancelled, or an illegal
//! request arrives.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use flowcheck_proto::{
    MAX_DEMAND, NonPositiveRequest, Publisher, Subscriber, Subscription, add_demand,
};
use parking_lot::{Condvar, Mutex};

use crate::Element;

/// Maps an element index to the element emitted at that position.
pub type ElementFactory<T> = Arc<dyn Fn(u64) -> T + Send + Sync>;

/// Element count meaning "never complete".
const UNBOUNDED: u64 = u64::MAX;

/// How often an idle worker checks whether its subscription was abandoned.
const IDLE_CHECK: Duration = Duration::from_millis(100);

/// Worker threads of every helper publisher that have not exited yet.
static RUNNING_WORKERS: AtomicUsize = AtomicUsize::new(0);

/// Publisher emitting a fixed or unbounded number of generated elements.
pub struct HelperPublisher<T> {
    elements: u64,
    factory: ElementFactory<T>,
    subscriptions: Mutex<Vec<Weak<HelperSubscription>>>,
}

impl<T: Element> HelperPublisher<T> {
    /// Publisher emitting `elements` elements, then completing.
    pub fn new(elements: u64, factory: ElementFactory<T>) -> Arc<Self> {
        Arc::new(Self { elements, factory, subscriptions: Mutex::new(Vec::new()) })
    }

    /// Publisher that never completes.
    pub fn unbounded(factory: ElementFactory<T>) -> Arc<Self> {
        Self::new(UNBOUNDED, factory)
    }

    /// Number of elements each subscriber receives, `None` if unbounded.
    pub fn element_count(&self) -> Option<u64> {
        (self.elements != UNBOUNDED).then_some(self.elements)
    }

    /// Cancel every subscription still open, stopping their workers.
    ///
    /// For owners that stop using the stream without its subscriber ever
    /// cancelling, such as a processor fed by this publisher.
    pub fn cancel_all(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions.iter().filter_map(Weak::upgrade) {
            subscription.cancel();
        }
    }

    /// Number of helper worker threads, across all helper publishers, that
    /// have not exited yet.
    pub fn running_workers() -> usize {
        RUNNING_WORKERS.load(Ordering::Acquire)
    }
}

/// Counts a worker as running until it is dropped at thread exit.
struct WorkerGuard;

impl WorkerGuard {
    fn enter() -> Self {
        RUNNING_WORKERS.fetch_add(1, Ordering::AcqRel);
        Self
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        RUNNING_WORKERS.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct DemandState {
    demand: i64,
    cancelled: bool,
    illegal: Option<i64>,
}

#[derive(Default)]
struct HelperSubscription {
    state: Mutex<DemandState>,
    changed: Condvar,
}

enum Step {
    Emit,
    Reject(i64),
    Stop,
}

impl HelperSubscription {
    /// Block until the worker may emit one element, or must stop.
    fn next_step(self: &Arc<Self>) -> Step {
        let mut state = self.state.lock();
        loop {
            if state.cancelled {
                return Step::Stop;
            }
            if let Some(requested) = state.illegal.take() {
                state.cancelled = true;
                return Step::Reject(requested);
            }
            if state.demand > 0 {
                if state.demand != MAX_DEMAND {
                    state.demand -= 1;
                }
                return Step::Emit;
            }
            // Only the worker holds the subscription: nobody can request
            // anymore.
            if self.changed.wait_for(&mut state, IDLE_CHECK).timed_out()
                && Arc::strong_count(self) == 1
            {
                return Step::Stop;
            }
        }
    }
}

impl Subscription for HelperSubscription {
    fn request(&self, n: i64) {
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }
        if n <= 0 {
            if state.illegal.is_none() {
                state.illegal = Some(n);
            }
        } else {
            state.demand = add_demand(state.demand, n);
        }
        drop(state);
        self.changed.notify_all();
    }

    fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.changed.notify_all();
    }
}

fn run_worker<T>(
    subscription: Arc<HelperSubscription>,
    subscriber: Arc<dyn Subscriber<T>>,
    elements: u64,
    factory: ElementFactory<T>,
) {
    let mut emitted = 0_u64;
    loop {
        if elements != UNBOUNDED && emitted == elements {
            subscriber.on_complete();
            return;
        }
        match subscription.next_step() {
            Step::Emit => {
                subscriber.on_next(factory(emitted));
                emitted += 1;
            },
            Step::Reject(requested) => {
                subscriber.on_error(NonPositiveRequest::signal(requested));
                return;
            },
            Step::Stop => return,
        }
    }
}

impl<T: Element> Publisher<T> for HelperPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Arc::new(HelperSubscription::default());
        {
            let mut open = self.subscriptions.lock();
            open.retain(|weak| weak.strong_count() > 0);
            open.push(Arc::downgrade(&subscription));
        }
        let handle: Arc<dyn Subscription> = subscription.clone();
        subscriber.on_subscribe(handle);

        let worker_subscriber = Arc::clone(&subscriber);
        let elements = self.elements;
        let factory = Arc::clone(&self.factory);

        let guard = WorkerGuard::enter();
        let spawned = thread::Builder::new().name("flowcheck-helper".to_string()).spawn(move || {
            let _guard = guard;
            run_worker(subscription, worker_subscriber, elements, factory);
        });

        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to spawn helper publisher worker");
            subscriber.on_error(Arc::new(err));
        }
    }
}
