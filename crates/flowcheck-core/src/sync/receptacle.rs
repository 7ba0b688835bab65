//! Bounded FIFO of observed elements and the end-of-stream marker.

use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::Arc,
    time::{Duration, Instant},
};

use flowcheck_proto::SignalError;
use parking_lot::{Condvar, Mutex};

use crate::{
    env::{TEST_BUFFER_SIZE, TestEnvironment},
    error::Failure,
};

/// One entry taken from a [`Receptacle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<T> {
    /// An element.
    Next(T),
    /// The stream completed.
    EndOfStream,
}

struct Queue<T> {
    entries: VecDeque<Delivery<T>>,
    completed: bool,
}

/// Bounded buffer of `on_next` payloads followed by an optional
/// end-of-stream marker.
///
/// Producers call [`Receptacle::add`] and [`Receptacle::complete`] from any
/// thread; the scenario driver takes entries with deadlines. The capacity is
/// deliberately small: a producer that emits far more than was requested
/// trips a distinguishable [`Failure::Overflow`].
pub struct Receptacle<T> {
    env: Arc<TestEnvironment>,
    capacity: usize,
    queue: Mutex<Queue<T>>,
    arrived: Condvar,
}

impl<T: Debug> Receptacle<T> {
    /// Default capacity: twice the assumed stage buffer.
    pub const DEFAULT_CAPACITY: usize = 2 * TEST_BUFFER_SIZE;

    /// Create an empty receptacle with the default capacity.
    pub fn new(env: Arc<TestEnvironment>) -> Self {
        Self::with_capacity(env, Self::DEFAULT_CAPACITY)
    }

    /// Create an empty receptacle holding at most `capacity` elements.
    pub fn with_capacity(env: Arc<TestEnvironment>, capacity: usize) -> Self {
        Self {
            env,
            capacity,
            queue: Mutex::new(Queue { entries: VecDeque::new(), completed: false }),
            arrived: Condvar::new(),
        }
    }

    /// Buffer an element.
    ///
    /// Recorded as a failure (and dropped) after completion or when full.
    pub fn add(&self, value: T) {
        let mut queue = self.queue.lock();
        if queue.completed {
            drop(queue);
            self.env.flop(format!("unexpected element {value:?} received after stream completed"));
            return;
        }
        if queue.entries.len() >= self.capacity {
            drop(queue);
            self.env.record(Failure::Overflow {
                context: format!("receptacle rejected element {value:?}"),
                capacity: self.capacity,
            });
            return;
        }
        queue.entries.push_back(Delivery::Next(value));
        drop(queue);
        self.arrived.notify_all();
    }

    /// Append the end-of-stream marker. A second completion is a failure.
    pub fn complete(&self) {
        let mut queue = self.queue.lock();
        if queue.completed {
            drop(queue);
            self.env.flop("unexpected additional complete signal received");
            return;
        }
        queue.completed = true;
        queue.entries.push_back(Delivery::EndOfStream);
        drop(queue);
        self.arrived.notify_all();
    }

    /// Returns true once the end-of-stream marker was added.
    pub fn is_completed(&self) -> bool {
        self.queue.lock().completed
    }

    /// Number of entries waiting to be taken.
    pub fn len(&self) -> usize {
        self.queue.lock().entries.len()
    }

    /// Returns true if nothing is waiting to be taken.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop_until(&self, deadline: Instant) -> Option<Delivery<T>> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(entry) = queue.entries.pop_front() {
                return Some(entry);
            }
            if self.arrived.wait_until(&mut queue, deadline).timed_out() {
                return queue.entries.pop_front();
            }
        }
    }

    /// Take the next entry if one arrives within `window`, recording nothing.
    pub fn try_next_within(&self, window: Duration) -> Option<Delivery<T>> {
        self.pop_until(Instant::now() + window)
    }

    /// Take the next element, waiting up to the default timeout.
    pub fn next(&self, message: &str) -> Result<T, Failure> {
        self.next_within(self.env.default_timeout(), message)
    }

    /// Take the next element, waiting up to `timeout`.
    ///
    /// Fails on timeout and on end-of-stream.
    pub fn next_within(&self, timeout: Duration, message: &str) -> Result<T, Failure> {
        match self.pop_until(Instant::now() + timeout) {
            Some(Delivery::Next(value)) => Ok(value),
            Some(Delivery::EndOfStream) => Err(self
                .env
                .flop_and_fail(format!("{message}: expected element but got end-of-stream"))),
            None => {
                Err(self.env.flop_and_fail(format!("{message} within {} ms", timeout.as_millis())))
            },
        }
    }

    /// Take the next element or end-of-stream (`None`), waiting up to
    /// `timeout`.
    pub fn next_or_end_of_stream_within(
        &self,
        timeout: Duration,
        message: &str,
    ) -> Result<Option<T>, Failure> {
        match self.pop_until(Instant::now() + timeout) {
            Some(Delivery::Next(value)) => Ok(Some(value)),
            Some(Delivery::EndOfStream) => Ok(None),
            None => {
                Err(self.env.flop_and_fail(format!("{message} within {} ms", timeout.as_millis())))
            },
        }
    }

    /// Take `count` elements within one aggregate `timeout`.
    pub fn next_n(
        &self,
        count: usize,
        timeout: Duration,
        message: &str,
    ) -> Result<Vec<T>, Failure> {
        let deadline = Instant::now() + timeout;
        let mut values = Vec::with_capacity(count);
        while values.len() < count {
            match self.pop_until(deadline) {
                Some(Delivery::Next(value)) => values.push(value),
                Some(Delivery::EndOfStream) => {
                    return Err(self.env.flop_and_fail(format!(
                        "{message}: expected element but got end-of-stream after {} of {count}",
                        values.len()
                    )));
                },
                None => {
                    return Err(self.env.flop_and_fail(format!(
                        "{message} within {} ms (received {} of {count})",
                        timeout.as_millis(),
                        values.len()
                    )));
                },
            }
        }
        Ok(values)
    }

    /// Expect the end-of-stream marker to be next, waiting up to `timeout`.
    pub fn expect_completion_within(
        &self,
        timeout: Duration,
        message: &str,
    ) -> Result<(), Failure> {
        match self.pop_until(Instant::now() + timeout) {
            Some(Delivery::EndOfStream) => Ok(()),
            Some(Delivery::Next(value)) => Err(self.env.flop_and_fail(format!(
                "{message}: expected end-of-stream but got element [{value:?}]"
            ))),
            None => {
                Err(self.env.flop_and_fail(format!("{message} within {} ms", timeout.as_millis())))
            },
        }
    }

    /// Assert that nothing arrives during `window`.
    pub fn expect_none_within(&self, window: Duration, message: &str) -> Result<(), Failure> {
        match self.pop_until(Instant::now() + window) {
            None => Ok(()),
            Some(Delivery::Next(value)) => {
                Err(self.env.flop_and_fail(format!("{message} [{value:?}]")))
            },
            Some(Delivery::EndOfStream) => Err(self
                .env
                .flop_and_fail(format!("{message}: expected no element but got on_complete"))),
        }
    }

    /// Wait for the environment to capture an error of kind `E`.
    pub fn expect_error<E>(
        &self,
        total_timeout: Duration,
        poll_interval: Duration,
        message: &str,
    ) -> Result<SignalError, Failure>
    where
        E: std::error::Error + 'static,
    {
        self.env.expect_error::<E>(total_timeout, poll_interval, message)
    }
}
