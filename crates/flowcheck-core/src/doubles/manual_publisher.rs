//! Scriptable publisher that records upstream demand.

use std::{sync::Arc, time::Duration};

use flowcheck_proto::{Publisher, SignalError, Subscriber, Subscription};

use crate::{
    Element,
    env::TestEnvironment,
    error::Failure,
    signal::{Signal, SignalScope},
    sync::{Latch, Promise, Receptacle},
};

fn terminal_scope() -> Option<Signal> {
    SignalScope::current().filter(|signal| matches!(signal, Signal::OnComplete | Signal::OnError))
}

/// Subscription handed out by [`ManualPublisher`].
///
/// Every `request(n)` is queued verbatim, so scenarios can assert on the
/// magnitude and order of demand; `cancel` closes a latch.
struct ManualSubscription {
    env: Arc<TestEnvironment>,
    requests: Arc<Receptacle<i64>>,
    cancelled: Arc<Latch>,
}

impl Subscription for ManualSubscription {
    fn request(&self, n: i64) {
        if let Some(signal) = terminal_scope() {
            self.env.flop(format!(
                "subscription::request({n}) called from within subscriber::{signal}, \
                 which is illegal according to rule 2.3"
            ));
        }
        self.env.debug(format!("manual publisher received request({n})"));
        self.requests.add(n);
    }

    fn cancel(&self) {
        if let Some(signal) = terminal_scope() {
            self.env.flop(format!(
                "subscription::cancel called from within subscriber::{signal}, \
                 which is illegal according to rule 2.3"
            ));
        }
        self.env.debug("manual publisher received cancel");
        self.cancelled.close();
    }
}

/// Correct reference publisher for a single subscriber.
///
/// Elements and terminal signals are injected by the scenario through the
/// `send_*` methods; demand and cancellation coming back upstream are
/// recorded for the `expect_*` assertions.
pub struct ManualPublisher<T> {
    env: Arc<TestEnvironment>,
    requests: Arc<Receptacle<i64>>,
    cancelled: Arc<Latch>,
    subscriber: Promise<Arc<dyn Subscriber<T>>>,
}

impl<T: Element> ManualPublisher<T> {
    /// Create a publisher with no subscriber attached.
    pub fn new(env: Arc<TestEnvironment>) -> Arc<Self> {
        Arc::new(Self {
            requests: Arc::new(Receptacle::new(Arc::clone(&env))),
            cancelled: Arc::new(Latch::new(Arc::clone(&env))),
            subscriber: Promise::new(Arc::clone(&env)),
            env,
        })
    }

    /// The attached subscriber, if any.
    pub fn subscriber(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.subscriber.try_value()
    }

    fn attached(&self, signal: Signal) -> Result<Arc<dyn Subscriber<T>>, Failure> {
        self.subscriber.try_value().ok_or_else(|| {
            self.env.flop_and_fail(format!("cannot send {signal}: no subscriber attached"))
        })
    }

    /// Deliver `element` to the subscriber.
    pub fn send_next(&self, element: T) -> Result<(), Failure> {
        let subscriber = self.attached(Signal::OnNext)?;
        self.env.debug(format!("manual publisher sending on_next({element:?})"));
        let _scope = SignalScope::enter(Signal::OnNext);
        subscriber.on_next(element);
        Ok(())
    }

    /// Complete the subscriber.
    pub fn send_completion(&self) -> Result<(), Failure> {
        let subscriber = self.attached(Signal::OnComplete)?;
        self.env.debug("manual publisher sending on_complete");
        let _scope = SignalScope::enter(Signal::OnComplete);
        subscriber.on_complete();
        Ok(())
    }

    /// Fail the subscriber with `cause`.
    pub fn send_error(&self, cause: SignalError) -> Result<(), Failure> {
        let subscriber = self.attached(Signal::OnError)?;
        self.env.debug(format!("manual publisher sending on_error({cause})"));
        let _scope = SignalScope::enter(Signal::OnError);
        subscriber.on_error(cause);
        Ok(())
    }

    /// Wait the default timeout for the next `request` call and return its
    /// argument.
    pub fn expect_request(&self) -> Result<i64, Failure> {
        let timeout = self.env.default_timeout();
        self.expect_request_within(timeout, "did not receive expected request call")
    }

    /// Wait up to `timeout` for the next `request` call.
    pub fn expect_request_within(&self, timeout: Duration, message: &str) -> Result<i64, Failure> {
        let requested = self.requests.next_within(timeout, message)?;
        if requested <= 0 {
            return Err(self.env.flop_and_fail(format!(
                "{message}: request({requested}) is non-positive, which is illegal according to \
                 rule 3.9"
            )));
        }
        Ok(requested)
    }

    /// Wait for the next `request` call and require its argument to be
    /// exactly `expected`.
    pub fn expect_exact_request(&self, expected: i64) -> Result<(), Failure> {
        let requested = self.expect_request()?;
        if requested == expected {
            Ok(())
        } else {
            Err(self.env.flop_and_fail(format!(
                "received request({requested}) where request({expected}) was expected"
            )))
        }
    }

    /// Assert that no `request` arrives within the no-signals window.
    pub fn expect_no_request(&self) -> Result<(), Failure> {
        self.expect_no_request_within(
            self.env.default_no_signals_timeout(),
            "received an unexpected call to request",
        )
    }

    /// Assert that no `request` arrives within `window`.
    pub fn expect_no_request_within(&self, window: Duration, message: &str) -> Result<(), Failure> {
        self.requests.expect_none_within(window, message)
    }

    /// Wait the default timeout for `cancel`.
    pub fn expect_cancelling(&self) -> Result<(), Failure> {
        let timeout = self.env.default_timeout();
        self.expect_cancelling_within(timeout, "did not receive expected cancel call")
    }

    /// Wait up to `timeout` for `cancel`.
    pub fn expect_cancelling_within(
        &self,
        timeout: Duration,
        message: &str,
    ) -> Result<(), Failure> {
        self.cancelled.expect_close_within(timeout, message)
    }

    /// Returns true once the subscriber cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_closed()
    }
}

impl<T: Element> Publisher<T> for ManualPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if self.subscriber.is_completed() {
            self.env.flop("manual publisher does not support more than one subscriber");
            return;
        }
        self.subscriber.complete(Arc::clone(&subscriber));

        let subscription = ManualSubscription {
            env: Arc::clone(&self.env),
            requests: Arc::clone(&self.requests),
            cancelled: Arc::clone(&self.cancelled),
        };
        let _scope = SignalScope::enter(Signal::OnSubscribe);
        subscriber.on_subscribe(Arc::new(subscription));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use flowcheck_proto::NonPositiveRequest;

    use super::*;
    use crate::{doubles::ManualSubscriber, env::EnvironmentConfig};

    fn env() -> Arc<TestEnvironment> {
        TestEnvironment::new(
            EnvironmentConfig::default()
                .with_default_timeout(Duration::from_millis(50))
                .with_no_signals_timeout(Duration::from_millis(10)),
        )
    }

    #[test]
    fn records_requests_in_order() {
        let env = env();
        let publisher = ManualPublisher::<u32>::new(Arc::clone(&env));
        let subscriber = ManualSubscriber::<u32>::new(Arc::clone(&env));
        env.subscribe::<u32>(&*publisher, &subscriber).unwrap();

        subscriber.request(2).unwrap();
        subscriber.request(5).unwrap();

        assert_eq!(publisher.expect_request().unwrap(), 2);
        publisher.expect_exact_request(5).unwrap();
        publisher.expect_no_request().unwrap();
    }

    #[test]
    fn forwards_injected_signals() {
        let env = env();
        let publisher = ManualPublisher::<u32>::new(Arc::clone(&env));
        let subscriber = ManualSubscriber::<u32>::new(Arc::clone(&env));
        env.subscribe::<u32>(&*publisher, &subscriber).unwrap();

        publisher.send_next(10_u32).unwrap();
        publisher.send_completion().unwrap();

        subscriber.expect_next(10).unwrap();
        subscriber.expect_completion().unwrap();
        env.verify_no_async_errors_no_delay().unwrap();
    }

    #[test]
    fn send_without_subscriber_fails() {
        let env = env();
        let publisher = ManualPublisher::<u8>::new(Arc::clone(&env));

        let err = publisher.send_error(NonPositiveRequest::signal(0)).unwrap_err();
        assert_eq!(err.to_string(), "cannot send on_error: no subscriber attached");
    }

    #[test]
    fn second_subscriber_is_rejected() {
        let env = env();
        let publisher = ManualPublisher::<u8>::new(Arc::clone(&env));
        publisher.subscribe(ManualSubscriber::<u8>::new(Arc::clone(&env)));
        publisher.subscribe(ManualSubscriber::<u8>::new(Arc::clone(&env)));

        assert_eq!(
            env.drop_async_error().map(|f| f.to_string()),
            Some("manual publisher does not support more than one subscriber".to_string())
        );
    }

    #[test]
    fn cancel_closes_latch() {
        let env = env();
        let publisher = ManualPublisher::<u8>::new(Arc::clone(&env));
        let subscriber = ManualSubscriber::<u8>::new(Arc::clone(&env));
        env.subscribe::<u8>(&*publisher, &subscriber).unwrap();

        assert!(!publisher.is_cancelled());
        subscriber.cancel().unwrap();
        publisher.expect_cancelling().unwrap();
    }
}
