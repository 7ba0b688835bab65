//! One-shot open/closed latch.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{env::TestEnvironment, error::Failure};

/// Binary latch: open until [`Latch::close`] is called.
///
/// Closing is idempotent. [`Latch::reopen`] resets it explicitly.
pub struct Latch {
    env: Arc<TestEnvironment>,
    closed: Mutex<bool>,
    changed: Condvar,
}

impl Latch {
    /// Create an open latch.
    pub fn new(env: Arc<TestEnvironment>) -> Self {
        Self { env, closed: Mutex::new(false), changed: Condvar::new() }
    }

    /// Close the latch and wake every waiter.
    pub fn close(&self) {
        *self.closed.lock() = true;
        self.changed.notify_all();
    }

    /// Return the latch to the open state.
    pub fn reopen(&self) {
        *self.closed.lock() = false;
    }

    /// Returns true once the latch has been closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Wait up to the default timeout for the latch to close.
    pub fn expect_close(&self, message: &str) -> Result<(), Failure> {
        self.expect_close_within(self.env.default_timeout(), message)
    }

    /// Wait up to `timeout` for the latch to close.
    pub fn expect_close_within(&self, timeout: Duration, message: &str) -> Result<(), Failure> {
        let deadline = Instant::now() + timeout;
        let mut closed = self.closed.lock();
        while !*closed {
            if self.changed.wait_until(&mut closed, deadline).timed_out() {
                break;
            }
        }

        if *closed {
            Ok(())
        } else {
            drop(closed);
            Err(self.env.flop_and_fail(format!("{message} within {} ms", timeout.as_millis())))
        }
    }

    /// Record a failure unless the latch is still open.
    ///
    /// Non-blocking and safe on callback threads. Returns whether the latch
    /// was open.
    pub fn assert_open(&self, message: &str) -> bool {
        let open = !self.is_closed();
        if !open {
            self.env.flop(message);
        }
        open
    }

    /// Record a failure unless the latch is already closed.
    ///
    /// Non-blocking and safe on callback threads. Returns whether the latch
    /// was closed.
    pub fn assert_closed(&self, message: &str) -> bool {
        let closed = self.is_closed();
        if !closed {
            self.env.flop(message);
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvironmentConfig;

    fn env() -> Arc<TestEnvironment> {
        TestEnvironment::new(
            EnvironmentConfig::default().with_default_timeout(Duration::from_millis(40)),
        )
    }

    #[test]
    fn close_from_other_thread_releases_waiter() {
        let env = env();
        let latch = Arc::new(Latch::new(Arc::clone(&env)));
        let closer = Arc::clone(&latch);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            closer.close();
        });

        latch.expect_close_within(Duration::from_secs(1), "latch never closed").unwrap();
        handle.join().unwrap();
        assert!(env.verify_no_async_errors_no_delay().is_ok());
    }

    #[test]
    fn expect_close_times_out_with_flop() {
        let env = env();
        let latch = Latch::new(Arc::clone(&env));

        let err = latch.expect_close("latch never closed").unwrap_err();

        assert_eq!(err.to_string(), "latch never closed within 40 ms");
        assert_eq!(env.async_error_count(), 1);
    }

    #[test]
    fn state_assertions_flop_without_blocking() {
        let env = env();
        let latch = Latch::new(Arc::clone(&env));

        assert!(latch.assert_open("should be open"));
        assert!(!latch.assert_closed("not closed yet"));
        latch.close();
        latch.close();
        assert!(latch.assert_closed("should be closed"));
        assert!(!latch.assert_open("already closed"));

        let messages: Vec<_> = env.async_errors().iter().map(ToString::to_string).collect();
        assert_eq!(messages, vec!["not closed yet", "already closed"]);
    }

    #[test]
    fn reopen_resets() {
        let latch = Latch::new(env());
        latch.close();
        assert!(latch.is_closed());
        latch.reopen();
        assert!(!latch.is_closed());
    }
}
