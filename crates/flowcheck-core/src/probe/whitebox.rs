//! Steering a subscriber under test through its puppet.

use std::{sync::Arc, time::Duration};

use flowcheck_proto::SignalError;

use crate::{Element, env::TestEnvironment, error::Failure, probe::BlackboxProbe, sync::Promise};

/// Hook a subscriber under test exposes so that scenarios can make it act.
///
/// The subscriber registers its puppet with
/// [`WhiteboxSubscriberProbe::register_on_subscribe`] from inside its own
/// `on_subscribe`.
pub trait SubscriberPuppet: Send + Sync {
    /// Make the subscriber request `n` more elements from its subscription.
    fn trigger_request(&self, n: i64);

    /// Make the subscriber cancel its subscription.
    fn signal_cancel(&self);
}

/// A [`BlackboxProbe`] plus the puppet of the subscriber under test.
pub struct WhiteboxSubscriberProbe<T> {
    env: Arc<TestEnvironment>,
    blackbox: Arc<BlackboxProbe<T>>,
    puppet: Promise<Arc<dyn SubscriberPuppet>>,
}

impl<T: Element> WhiteboxSubscriberProbe<T> {
    /// Create a probe with no puppet registered.
    pub fn new(env: Arc<TestEnvironment>) -> Arc<Self> {
        Arc::new(Self {
            blackbox: BlackboxProbe::new(Arc::clone(&env)),
            puppet: Promise::new(Arc::clone(&env)),
            env,
        })
    }

    /// The signal record shared with the blackbox posture.
    pub fn blackbox(&self) -> &BlackboxProbe<T> {
        &self.blackbox
    }

    /// Register the subscriber's puppet. Later registrations are ignored.
    pub fn register_on_subscribe(&self, puppet: Arc<dyn SubscriberPuppet>) {
        if self.puppet.is_completed() {
            self.env.debug("ignoring second puppet registration");
        } else {
            self.puppet.complete(puppet);
        }
    }

    /// Record an `on_next`.
    pub fn register_on_next(&self, element: T) {
        self.blackbox.register_on_next(element);
    }

    /// Record an `on_complete`.
    pub fn register_on_complete(&self) {
        self.blackbox.register_on_complete();
    }

    /// Record an `on_error`.
    pub fn register_on_error(&self, cause: SignalError) {
        self.blackbox.register_on_error(cause);
    }

    /// Returns true once a puppet was registered.
    pub fn has_puppet(&self) -> bool {
        self.puppet.is_completed()
    }

    /// Wait the default timeout for the puppet.
    pub fn puppet(&self) -> Result<Arc<dyn SubscriberPuppet>, Failure> {
        self.puppet_within(self.env.default_timeout())
    }

    /// Wait up to `timeout` for the puppet.
    pub fn puppet_within(&self, timeout: Duration) -> Result<Arc<dyn SubscriberPuppet>, Failure> {
        self.puppet.expect_completion_within(
            timeout,
            "subscriber under test did not call register_on_subscribe",
        )
    }

    /// Wait for the next element and require it to equal `expected`.
    pub fn expect_next(&self, expected: T) -> Result<(), Failure> {
        self.blackbox.expect_next(expected)
    }

    /// Wait the default timeout for the next element.
    pub fn expect_next_element(&self) -> Result<T, Failure> {
        self.blackbox.expect_next_element()
    }

    /// Wait the default timeout for `on_complete`.
    pub fn expect_completion(&self) -> Result<(), Failure> {
        self.blackbox.expect_completion()
    }

    /// Wait the default timeout for an `on_error` of kind `E`.
    pub fn expect_error<E>(&self) -> Result<SignalError, Failure>
    where
        E: std::error::Error + 'static,
    {
        self.blackbox.expect_error::<E>()
    }

    /// Wait the default timeout for `on_error` carrying exactly `expected`.
    pub fn expect_error_same(&self, expected: &SignalError) -> Result<(), Failure> {
        self.blackbox.expect_error_same(expected)
    }

    /// Assert that nothing arrives within the no-signals window.
    pub fn expect_none(&self) -> Result<(), Failure> {
        self.blackbox.expect_none()
    }
}
