//! Recording what a subscriber under test receives.

use std::{sync::Arc, time::Duration};

use flowcheck_proto::{SignalError, Subscriber, Subscription};

use crate::{
    Element,
    env::TestEnvironment,
    error::Failure,
    signal::{Signal, SignalScope},
    sync::{Promise, Receptacle},
};

/// Record of the signals delivered to one subscriber under test.
///
/// Terminal signals may be registered only once; a second `on_complete` or
/// `on_error` is recorded as a violation of rule 1.7.
pub struct BlackboxProbe<T> {
    env: Arc<TestEnvironment>,
    elements: Receptacle<T>,
    error: Promise<SignalError>,
}

impl<T: Element> BlackboxProbe<T> {
    /// Create an empty probe.
    pub fn new(env: Arc<TestEnvironment>) -> Arc<Self> {
        Arc::new(Self {
            elements: Receptacle::new(Arc::clone(&env)),
            error: Promise::new(Arc::clone(&env)),
            env,
        })
    }

    /// Record an `on_next`.
    pub fn register_on_next(&self, element: T) {
        self.elements.add(element);
    }

    /// Record an `on_complete`.
    pub fn register_on_complete(&self) {
        if self.elements.is_completed() {
            self.env.flop(
                "subscriber::on_complete was called a second time, which is illegal according to \
                 rule 1.7",
            );
        } else {
            self.elements.complete();
        }
    }

    /// Record an `on_error`.
    pub fn register_on_error(&self, cause: SignalError) {
        if self.error.is_completed() {
            self.env.flop(format!(
                "subscriber::on_error({cause}) was called a second time, which is illegal \
                 according to rule 1.7"
            ));
        } else {
            self.error.complete(cause);
        }
    }

    /// Wait the default timeout for the next element.
    pub fn expect_next_element(&self) -> Result<T, Failure> {
        self.elements.next_within(
            self.env.default_timeout(),
            "subscriber under test did not call register_on_next",
        )
    }

    /// Wait for the next element and require it to equal `expected`.
    pub fn expect_next(&self, expected: T) -> Result<(), Failure> {
        let received = self.expect_next_element()?;
        if received == expected {
            Ok(())
        } else {
            Err(self.env.flop_and_fail(format!(
                "subscriber under test received {received:?} but expected {expected:?}"
            )))
        }
    }

    /// Wait the default timeout for `on_complete`.
    pub fn expect_completion(&self) -> Result<(), Failure> {
        self.expect_completion_within(self.env.default_timeout())
    }

    /// Wait up to `timeout` for `on_complete`.
    pub fn expect_completion_within(&self, timeout: Duration) -> Result<(), Failure> {
        self.elements.expect_completion_within(
            timeout,
            "subscriber under test did not call register_on_complete",
        )
    }

    fn registered_error(&self, timeout: Duration) -> Result<SignalError, Failure> {
        self.error.expect_completion_within(
            timeout,
            "subscriber under test did not call register_on_error",
        )
    }

    /// Wait the default timeout for an `on_error` of kind `E`.
    pub fn expect_error<E>(&self) -> Result<SignalError, Failure>
    where
        E: std::error::Error + 'static,
    {
        let cause = self.registered_error(self.env.default_timeout())?;
        if cause.downcast_ref::<E>().is_some() {
            Ok(cause)
        } else {
            Err(self.env.flop_and_fail(format!(
                "subscriber under test received on_error [{cause}] but expected an error of \
                 kind {}",
                std::any::type_name::<E>()
            )))
        }
    }

    /// Wait the default timeout for `on_error` carrying exactly `expected`.
    pub fn expect_error_same(&self, expected: &SignalError) -> Result<(), Failure> {
        let cause = self.registered_error(self.env.default_timeout())?;
        if Arc::ptr_eq(&cause, expected) {
            Ok(())
        } else {
            Err(self.env.flop_and_fail(format!(
                "subscriber under test received on_error [{cause}] but expected [{expected}]"
            )))
        }
    }

    /// Assert that no element, completion or error arrives within the
    /// no-signals window.
    pub fn expect_none(&self) -> Result<(), Failure> {
        self.expect_none_within(self.env.default_no_signals_timeout())
    }

    /// Assert that nothing arrives within `window`.
    pub fn expect_none_within(&self, window: Duration) -> Result<(), Failure> {
        self.elements
            .expect_none_within(window, "subscriber under test received an unexpected element")?;
        match self.error.try_value() {
            None => Ok(()),
            Some(cause) => Err(self.env.flop_and_fail(format!(
                "subscriber under test received an unexpected on_error [{cause}]"
            ))),
        }
    }
}

/// Subscriber decorator that reports every signal to a [`BlackboxProbe`]
/// before forwarding it to the subscriber under test.
///
/// Terminal signals are forwarded inside a [`SignalScope`], so the
/// subscription can detect `request`/`cancel` issued from within them.
pub struct BlackboxSubscriberProxy<T> {
    probe: Arc<BlackboxProbe<T>>,
    subject: Arc<dyn Subscriber<T>>,
}

impl<T: Element> BlackboxSubscriberProxy<T> {
    /// Wrap `subject`, reporting to `probe`.
    pub fn new(probe: Arc<BlackboxProbe<T>>, subject: Arc<dyn Subscriber<T>>) -> Arc<Self> {
        Arc::new(Self { probe, subject })
    }

    /// The probe signals are reported to.
    pub fn probe(&self) -> &Arc<BlackboxProbe<T>> {
        &self.probe
    }
}

impl<T: Element> Subscriber<T> for BlackboxSubscriberProxy<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.subject.on_subscribe(subscription);
    }

    fn on_next(&self, element: T) {
        self.probe.register_on_next(element.clone());
        self.subject.on_next(element);
    }

    fn on_error(&self, error: SignalError) {
        self.probe.register_on_error(Arc::clone(&error));
        let _scope = SignalScope::enter(Signal::OnError);
        self.subject.on_error(error);
    }

    fn on_complete(&self) {
        self.probe.register_on_complete();
        let _scope = SignalScope::enter(Signal::OnComplete);
        self.subject.on_complete();
    }
}

#[cfg(test)]
mod tests {
    use flowcheck_proto::NonPositiveRequest;

    use super::*;
    use crate::env::EnvironmentConfig;

    fn env() -> Arc<TestEnvironment> {
        TestEnvironment::new(
            EnvironmentConfig::default()
                .with_default_timeout(Duration::from_millis(50))
                .with_no_signals_timeout(Duration::from_millis(10)),
        )
    }

    #[test]
    fn double_terminal_signals_violate_rule_1_7() {
        let env = env();
        let probe = BlackboxProbe::<u8>::new(Arc::clone(&env));

        probe.register_on_complete();
        probe.register_on_complete();
        probe.register_on_error(NonPositiveRequest::signal(0));
        probe.register_on_error(NonPositiveRequest::signal(0));

        let messages: Vec<_> = env.async_errors().iter().map(ToString::to_string).collect();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.contains("rule 1.7")));
    }

    #[test]
    fn expect_error_same_compares_identity() {
        let env = env();
        let probe = BlackboxProbe::<u8>::new(Arc::clone(&env));
        let cause = NonPositiveRequest::signal(-2);
        probe.register_on_error(Arc::clone(&cause));

        probe.expect_error_same(&cause).unwrap();
        let other = NonPositiveRequest::signal(-2);
        assert!(probe.expect_error_same(&other).is_err());
    }

    #[test]
    fn expect_none_sees_pending_error() {
        let env = env();
        let probe = BlackboxProbe::<u8>::new(Arc::clone(&env));
        probe.expect_none().unwrap();

        probe.register_on_error(NonPositiveRequest::signal(0));
        assert!(probe.expect_none().is_err());
    }

    #[test]
    fn proxy_reports_then_forwards_inside_scope() {
        struct ScopeRecorder(parking_lot::Mutex<Vec<Option<Signal>>>);
        impl Subscriber<u8> for ScopeRecorder {
            fn on_subscribe(&self, _subscription: Arc<dyn Subscription>) {}
            fn on_next(&self, _element: u8) {
                self.0.lock().push(SignalScope::current());
            }
            fn on_error(&self, _error: SignalError) {}
            fn on_complete(&self) {
                self.0.lock().push(SignalScope::current());
            }
        }

        let env = env();
        let probe = BlackboxProbe::<u8>::new(Arc::clone(&env));
        let subject = Arc::new(ScopeRecorder(parking_lot::Mutex::new(Vec::new())));
        let forwarded: Arc<dyn Subscriber<u8>> = subject.clone();
        let proxy = BlackboxSubscriberProxy::new(Arc::clone(&probe), forwarded);

        proxy.on_next(4);
        proxy.on_complete();

        probe.expect_next(4).unwrap();
        probe.expect_completion().unwrap();
        assert_eq!(*subject.0.lock(), vec![None, Some(Signal::OnComplete)]);
    }
}
