//! Scriptable subscriber that buffers what a publisher emits.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use flowcheck_proto::{MAX_DEMAND, SignalError, Subscriber, Subscription};

use crate::{
    Element,
    env::{TestEnvironment, check_error_message},
    error::Failure,
    signal::{ConcurrentAccessBarrier, Signal},
    sync::{Delivery, Promise, Receptacle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Buffer every payload.
    Buffered,
    /// Count payloads and drop them.
    Blackhole,
}

/// Correct reference subscriber.
///
/// Every callback checks protocol order (`on_subscribe` first, exactly once)
/// and records violations instead of panicking, so the publisher's thread is
/// never disrupted. Payloads and the completion marker go into a
/// [`Receptacle`] that the scenario drains with deadlines.
///
/// Variants:
/// - [`ManualSubscriber::new`]: an unexpected `on_error` is recorded with its
///   cause, to be matched later by [`ManualSubscriber::expect_error`].
/// - [`ManualSubscriber::with_error_collection`]: `on_error` fills a promise
///   instead, for scenarios where the error is the expected outcome.
/// - [`ManualSubscriber::blackhole`]: payloads are only counted.
pub struct ManualSubscriber<T> {
    env: Arc<TestEnvironment>,
    mode: Mode,
    received: Receptacle<T>,
    discarded: AtomicU64,
    subscription: Promise<Arc<dyn Subscription>>,
    error: Option<Promise<SignalError>>,
    barrier: ConcurrentAccessBarrier,
}

impl<T: Element> ManualSubscriber<T> {
    fn build(env: Arc<TestEnvironment>, mode: Mode, collect_errors: bool) -> Arc<Self> {
        Arc::new(Self {
            mode,
            received: Receptacle::new(Arc::clone(&env)),
            discarded: AtomicU64::new(0),
            subscription: Promise::new(Arc::clone(&env)),
            error: collect_errors.then(|| Promise::new(Arc::clone(&env))),
            barrier: ConcurrentAccessBarrier::new(Arc::clone(&env)),
            env,
        })
    }

    /// Buffering subscriber that records an unexpected `on_error` as a
    /// failure.
    pub fn new(env: Arc<TestEnvironment>) -> Arc<Self> {
        Self::build(env, Mode::Buffered, false)
    }

    /// Buffering subscriber that keeps the first `on_error` for inspection.
    pub fn with_error_collection(env: Arc<TestEnvironment>) -> Arc<Self> {
        Self::build(env, Mode::Buffered, true)
    }

    /// Subscriber that drains elements without buffering them.
    pub fn blackhole(env: Arc<TestEnvironment>) -> Arc<Self> {
        Self::build(env, Mode::Blackhole, false)
    }

    /// Returns true once `on_subscribe` arrived.
    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_completed()
    }

    /// The subscription, if `on_subscribe` arrived and it was not released.
    pub fn subscription(&self) -> Option<Arc<dyn Subscription>> {
        self.subscription.try_value()
    }

    /// Wait up to `timeout` for `on_subscribe`.
    pub fn expect_subscription_within(
        &self,
        timeout: Duration,
        message: &str,
    ) -> Result<Arc<dyn Subscription>, Failure> {
        self.subscription.expect_completion_within(timeout, message)
    }

    /// Drop this subscriber's handle on the subscription.
    ///
    /// Breaks the subscriber -> subscription -> subscriber cycle a publisher
    /// typically forms, before checking that the publisher let go.
    pub fn release_subscription(&self) -> Option<Arc<dyn Subscription>> {
        self.subscription.take()
    }

    /// Number of elements a blackhole subscriber dropped.
    pub fn discarded_count(&self) -> u64 {
        self.discarded.load(Ordering::Acquire)
    }

    /// The error collected by [`ManualSubscriber::with_error_collection`].
    pub fn received_error(&self) -> Option<SignalError> {
        self.error.as_ref().and_then(Promise::try_value)
    }

    fn active_subscription(&self, action: &str) -> Result<Arc<dyn Subscription>, Failure> {
        self.subscription.try_value().ok_or_else(|| {
            self.env.flop_and_fail(format!("cannot {action} without an active subscription"))
        })
    }

    /// Signal demand for `n` elements.
    pub fn request(&self, n: i64) -> Result<(), Failure> {
        let subscription = self.active_subscription("request")?;
        self.env.debug(format!("manual subscriber requesting {n}"));
        subscription.request(n);
        Ok(())
    }

    /// Cancel the subscription.
    pub fn cancel(&self) -> Result<(), Failure> {
        let subscription = self.active_subscription("cancel")?;
        self.env.debug("manual subscriber cancelling");
        subscription.cancel();
        Ok(())
    }

    /// Request one element and wait for it.
    pub fn request_next_element(&self) -> Result<T, Failure> {
        self.request(1)?;
        self.next_element()
    }

    /// Request one element and wait for it or for completion (`None`).
    pub fn request_next_element_or_end_of_stream(&self) -> Result<Option<T>, Failure> {
        self.request(1)?;
        self.received.next_or_end_of_stream_within(
            self.env.default_timeout(),
            "did not receive expected stream completion or element",
        )
    }

    /// Request one element and expect completion instead.
    pub fn request_end_of_stream(&self) -> Result<(), Failure> {
        self.request(1)?;
        self.expect_completion()
    }

    /// Request `n` elements at once and wait for all of them.
    pub fn request_next_elements(&self, n: usize) -> Result<Vec<T>, Failure> {
        self.request(i64::try_from(n).unwrap_or(MAX_DEMAND))?;
        self.next_elements(n)
    }

    /// Wait the default timeout for the next element.
    pub fn next_element(&self) -> Result<T, Failure> {
        self.next_element_within(self.env.default_timeout(), "did not receive expected element")
    }

    /// Wait up to `timeout` for the next element.
    pub fn next_element_within(&self, timeout: Duration, message: &str) -> Result<T, Failure> {
        self.received.next_within(timeout, message)
    }

    /// Wait the default timeout for the next element or completion (`None`).
    pub fn next_element_or_end_of_stream(&self) -> Result<Option<T>, Failure> {
        self.received.next_or_end_of_stream_within(
            self.env.default_timeout(),
            "did not receive expected stream completion or element",
        )
    }

    /// Wait the default timeout for `n` elements.
    pub fn next_elements(&self, n: usize) -> Result<Vec<T>, Failure> {
        let timeout = self.env.default_timeout();
        self.next_elements_within(n, timeout, "did not receive expected elements")
    }

    /// Wait up to `timeout` in total for `n` elements.
    pub fn next_elements_within(
        &self,
        n: usize,
        timeout: Duration,
        message: &str,
    ) -> Result<Vec<T>, Failure> {
        self.received.next_n(n, timeout, message)
    }

    /// Take the next entry if one arrives within `window`, recording nothing.
    pub fn try_next_within(&self, window: Duration) -> Option<Delivery<T>> {
        self.received.try_next_within(window)
    }

    /// Wait for the next element and require it to equal `expected`.
    pub fn expect_next(&self, expected: T) -> Result<(), Failure> {
        self.expect_next_within(expected, self.env.default_timeout())
    }

    /// Like [`ManualSubscriber::expect_next`] with an explicit timeout.
    pub fn expect_next_within(&self, expected: T, timeout: Duration) -> Result<(), Failure> {
        let received = self.next_element_within(timeout, "did not receive expected element")?;
        if received == expected {
            Ok(())
        } else {
            Err(self.env.flop_and_fail(format!(
                "expected element {expected:?} on downstream but received {received:?}"
            )))
        }
    }

    /// Wait the default timeout for completion.
    pub fn expect_completion(&self) -> Result<(), Failure> {
        self.expect_completion_within(
            self.env.default_timeout(),
            "did not receive expected stream completion",
        )
    }

    /// Wait up to `timeout` for completion.
    pub fn expect_completion_within(
        &self,
        timeout: Duration,
        message: &str,
    ) -> Result<(), Failure> {
        self.received.expect_completion_within(timeout, message)
    }

    /// Assert that no element or completion arrives within the no-signals
    /// window.
    pub fn expect_none(&self) -> Result<(), Failure> {
        self.expect_none_within(
            self.env.default_no_signals_timeout(),
            "did not expect an element but got element",
        )
    }

    /// Assert that nothing arrives within `window`.
    pub fn expect_none_within(&self, window: Duration, message: &str) -> Result<(), Failure> {
        self.received.expect_none_within(window, message)
    }

    /// Wait the default timeout for an `on_error` of kind `E`.
    pub fn expect_error<E>(&self) -> Result<SignalError, Failure>
    where
        E: std::error::Error + 'static,
    {
        self.expect_error_within::<E>(self.env.default_timeout())
    }

    /// Wait up to `timeout` for an `on_error` of kind `E`.
    ///
    /// With error collection the collected error is checked; otherwise the
    /// environment's failure sink is polled for the recorded cause.
    pub fn expect_error_within<E>(&self, timeout: Duration) -> Result<SignalError, Failure>
    where
        E: std::error::Error + 'static,
    {
        let Some(collected) = &self.error else {
            return self.env.expect_error::<E>(
                timeout,
                self.env.default_poll_interval(),
                "expected on_error",
            );
        };

        let cause = collected.expect_completion_within(timeout, "expected on_error")?;
        if cause.downcast_ref::<E>().is_some() {
            Ok(cause)
        } else {
            Err(self.env.flop_and_fail(format!(
                "expected on_error with an error of kind {} but got [{cause}]",
                std::any::type_name::<E>()
            )))
        }
    }

    /// Like [`ManualSubscriber::expect_error`], additionally requiring the
    /// message to mention one of `required_parts`.
    pub fn expect_error_with_message<E>(
        &self,
        required_parts: &[&str],
    ) -> Result<SignalError, Failure>
    where
        E: std::error::Error + 'static,
    {
        let cause = self.expect_error::<E>()?;
        check_error_message(&self.env, &cause, required_parts)?;
        Ok(cause)
    }

    fn check_subscribed(&self, signal: Signal, detail: &str) -> bool {
        if self.subscription.is_completed() {
            true
        } else {
            self.env.flop(format!(
                "subscriber::{signal}({detail}) called before subscriber::on_subscribe \
                 (rule 1.9)"
            ));
            false
        }
    }
}

impl<T: Element> Subscriber<T> for ManualSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.barrier.enter(Signal::OnSubscribe);
        if self.subscription.is_completed() {
            self.env.flop(
                "subscriber::on_subscribe called on an already-subscribed subscriber (rule 2.5)",
            );
            subscription.cancel();
        } else {
            self.subscription.complete(subscription);
        }
        self.barrier.leave();
    }

    fn on_next(&self, element: T) {
        self.barrier.enter(Signal::OnNext);
        if self.check_subscribed(Signal::OnNext, &format!("{element:?}")) {
            match self.mode {
                Mode::Buffered => self.received.add(element),
                Mode::Blackhole => {
                    self.discarded.fetch_add(1, Ordering::AcqRel);
                },
            }
        }
        self.barrier.leave();
    }

    fn on_error(&self, error: SignalError) {
        self.barrier.enter(Signal::OnError);
        if self.check_subscribed(Signal::OnError, &error.to_string()) {
            match &self.error {
                Some(collected) => collected.complete(error),
                None => self.env.flop_signal(error, "unexpected subscriber::on_error"),
            }
        }
        self.barrier.leave();
    }

    fn on_complete(&self) {
        self.barrier.enter(Signal::OnComplete);
        if self.check_subscribed(Signal::OnComplete, "") {
            self.received.complete();
        }
        self.barrier.leave();
    }
}
