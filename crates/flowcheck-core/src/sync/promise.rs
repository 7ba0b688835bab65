//! Single-assignment value cell.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{env::TestEnvironment, error::Failure};

enum Slot<T> {
    Empty,
    Completed(T),
    Released,
}

/// A value that is assigned exactly once.
///
/// Completing twice and reading before completion are recorded as failures
/// rather than returned, because both typically happen on a callback thread
/// owned by the implementation under test.
pub struct Promise<T> {
    env: Arc<TestEnvironment>,
    slot: Mutex<Slot<T>>,
    completed: Condvar,
}

impl<T: Clone> Promise<T> {
    /// Create an empty promise.
    pub fn new(env: Arc<TestEnvironment>) -> Self {
        Self { env, slot: Mutex::new(Slot::Empty), completed: Condvar::new() }
    }

    /// Create a promise that already holds `value`.
    pub fn completed(env: Arc<TestEnvironment>, value: T) -> Self {
        Self { env, slot: Mutex::new(Slot::Completed(value)), completed: Condvar::new() }
    }

    /// Assign the value. A second assignment is recorded as a failure and
    /// ignored.
    pub fn complete(&self, value: T) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Empty) {
            *slot = Slot::Completed(value);
            drop(slot);
            self.completed.notify_all();
        } else {
            drop(slot);
            self.env.flop("cannot complete a promise more than once");
        }
    }

    /// Returns true once a value was assigned (even if since released).
    pub fn is_completed(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Empty)
    }

    /// The assigned value.
    ///
    /// Reading before completion records a failure and yields `None`.
    pub fn value(&self) -> Option<T> {
        match &*self.slot.lock() {
            Slot::Completed(value) => return Some(value.clone()),
            Slot::Empty => {},
            Slot::Released => {
                self.env.flop("cannot access a promise value after it was released");
                return None;
            },
        }
        self.env.flop("cannot access promise value before completion");
        None
    }

    /// The assigned value, without recording anything if there is none.
    pub fn try_value(&self) -> Option<T> {
        match &*self.slot.lock() {
            Slot::Completed(value) => Some(value.clone()),
            Slot::Empty | Slot::Released => None,
        }
    }

    /// Move the value out, keeping the promise completed.
    ///
    /// Used to drop the harness's own reference before checking whether the
    /// implementation under test released its references.
    pub fn take(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Released) {
            Slot::Completed(value) => Some(value),
            Slot::Empty => {
                *slot = Slot::Empty;
                None
            },
            Slot::Released => None,
        }
    }

    /// Wait up to the default timeout for the value.
    pub fn expect_completion(&self, message: &str) -> Result<T, Failure> {
        self.expect_completion_within(self.env.default_timeout(), message)
    }

    /// Wait up to `timeout` for the value.
    pub fn expect_completion_within(&self, timeout: Duration, message: &str) -> Result<T, Failure> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            match &*slot {
                Slot::Completed(value) => return Ok(value.clone()),
                Slot::Released => {
                    drop(slot);
                    return Err(self.env.flop_and_fail(format!("{message}: value was released")));
                },
                Slot::Empty => {},
            }
            if self.completed.wait_until(&mut slot, deadline).timed_out()
                && matches!(*slot, Slot::Empty)
            {
                drop(slot);
                return Err(
                    self.env.flop_and_fail(format!("{message} within {} ms", timeout.as_millis()))
                );
            }
        }
    }
}
