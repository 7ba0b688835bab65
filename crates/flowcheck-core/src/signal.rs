//! Per-thread signal tracking.
//!
//! [`SignalScope`] marks which subscriber signal the harness is delivering on
//! the current thread, so a test-double subscription can tell that it is
//! being called from inside `on_complete` or `on_error` (rule 2.3).
//! [`ConcurrentAccessBarrier`] detects two threads signalling one subscriber
//! at the same time (rule 1.3).

use std::{
    cell::Cell,
    fmt,
    sync::Arc,
    thread::{self, ThreadId},
};

use parking_lot::Mutex;

use crate::env::TestEnvironment;

/// The four subscriber signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// `on_subscribe`
    OnSubscribe,
    /// `on_next`
    OnNext,
    /// `on_error`
    OnError,
    /// `on_complete`
    OnComplete,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnSubscribe => write!(f, "on_subscribe"),
            Self::OnNext => write!(f, "on_next"),
            Self::OnError => write!(f, "on_error"),
            Self::OnComplete => write!(f, "on_complete"),
        }
    }
}

thread_local! {
    static CURRENT_SIGNAL: Cell<Option<Signal>> = const { Cell::new(None) };
}

/// Guard marking the signal being delivered on this thread.
///
/// Scopes nest; dropping the guard restores the enclosing signal.
#[derive(Debug)]
#[must_use = "the scope ends when the guard is dropped"]
pub struct SignalScope {
    previous: Option<Signal>,
}

impl SignalScope {
    /// Mark `signal` as being delivered until the guard drops.
    pub fn enter(signal: Signal) -> Self {
        let previous = CURRENT_SIGNAL.with(|current| current.replace(Some(signal)));
        Self { previous }
    }

    /// The innermost signal being delivered on this thread, if any.
    pub fn current() -> Option<Signal> {
        CURRENT_SIGNAL.with(Cell::get)
    }

    /// Returns true while this thread is inside `on_complete` or `on_error`.
    pub fn in_terminal_signal() -> bool {
        matches!(Self::current(), Some(Signal::OnComplete | Signal::OnError))
    }
}

impl Drop for SignalScope {
    fn drop(&mut self) {
        let previous = self.previous;
        CURRENT_SIGNAL.with(|current| current.set(previous));
    }
}

struct Holder {
    thread: ThreadId,
    thread_name: String,
    signal: Signal,
    depth: usize,
}

/// Detects signals to one subscriber overlapping across threads.
///
/// Re-entrant on the owning thread: a synchronous `request` inside `on_next`
/// that leads to a nested `on_next` is not concurrent access.
pub struct ConcurrentAccessBarrier {
    env: Arc<TestEnvironment>,
    holder: Mutex<Option<Holder>>,
}

fn describe_current_thread() -> String {
    let current = thread::current();
    current.name().map_or_else(|| format!("{:?}", current.id()), ToString::to_string)
}

impl ConcurrentAccessBarrier {
    /// Create an unoccupied barrier.
    pub fn new(env: Arc<TestEnvironment>) -> Self {
        Self { env, holder: Mutex::new(None) }
    }

    /// Enter the critical section for `signal`.
    ///
    /// Records a failure if another thread is still inside.
    pub fn enter(&self, signal: Signal) {
        let me = thread::current().id();
        let mut holder = self.holder.lock();
        match holder.as_mut() {
            None => {
                *holder = Some(Holder {
                    thread: me,
                    thread_name: describe_current_thread(),
                    signal,
                    depth: 1,
                });
            },
            Some(current) if current.thread == me => current.depth += 1,
            Some(current) => {
                let message = format!(
                    "illegal concurrent access detected (entering critical section): thread {} \
                     emitted {signal} before thread {} finished its {} signal (rule 1.3)",
                    describe_current_thread(),
                    current.thread_name,
                    current.signal
                );
                drop(holder);
                self.env.flop(message);
            },
        }
    }

    /// Leave the critical section entered by this thread.
    pub fn leave(&self) {
        let me = thread::current().id();
        let mut holder = self.holder.lock();
        match holder.as_mut() {
            Some(current) if current.thread == me => {
                current.depth -= 1;
                if current.depth == 0 {
                    *holder = None;
                }
            },
            _ => {
                drop(holder);
                self.env.flop(format!(
                    "illegal concurrent access detected (leaving critical section): thread {} \
                     was not the signalling thread (rule 1.3)",
                    describe_current_thread()
                ));
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::env::EnvironmentConfig;

    #[test]
    fn scopes_nest_and_restore() {
        assert_eq!(SignalScope::current(), None);
        {
            let _outer = SignalScope::enter(Signal::OnNext);
            assert!(!SignalScope::in_terminal_signal());
            {
                let _inner = SignalScope::enter(Signal::OnComplete);
                assert!(SignalScope::in_terminal_signal());
            }
            assert_eq!(SignalScope::current(), Some(Signal::OnNext));
        }
        assert_eq!(SignalScope::current(), None);
    }

    #[test]
    fn scope_is_thread_local() {
        let _scope = SignalScope::enter(Signal::OnError);
        let seen = std::thread::spawn(SignalScope::current).join().unwrap();
        assert_eq!(seen, None);
    }

    #[test]
    fn barrier_allows_reentry_on_same_thread() {
        let env = TestEnvironment::new(EnvironmentConfig::default());
        let barrier = ConcurrentAccessBarrier::new(Arc::clone(&env));

        barrier.enter(Signal::OnNext);
        barrier.enter(Signal::OnNext);
        barrier.leave();
        barrier.leave();
        barrier.enter(Signal::OnComplete);
        barrier.leave();

        assert_eq!(env.async_error_count(), 0);
    }

    #[test]
    fn barrier_flags_second_thread() {
        let env = TestEnvironment::new(EnvironmentConfig::default());
        let barrier = Arc::new(ConcurrentAccessBarrier::new(Arc::clone(&env)));

        barrier.enter(Signal::OnNext);
        let other = Arc::clone(&barrier);
        std::thread::spawn(move || {
            other.enter(Signal::OnNext);
        })
        .join()
        .unwrap();
        std::thread::sleep(Duration::from_millis(1));
        barrier.leave();

        let failure = env.drop_async_error().unwrap();
        assert!(failure.to_string().contains("entering critical section"));
    }

    #[test]
    fn leaving_without_entering_is_flagged() {
        let env = TestEnvironment::new(EnvironmentConfig::default());
        let barrier = ConcurrentAccessBarrier::new(Arc::clone(&env));
        barrier.leave();
        assert_eq!(env.async_error_count(), 1);
    }
}
