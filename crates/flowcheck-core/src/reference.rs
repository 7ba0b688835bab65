//! Observing that a publisher released a subscriber.
//!
//! Ownership makes release observable directly: once every strong reference
//! is gone, `Weak::strong_count` reaches zero. The harness drops its own
//! references first, then gives the publisher a bounded window to drop its
//! own (rule 3.13).

use std::{
    sync::Weak,
    time::{Duration, Instant},
};

/// Wait up to `window` for every strong reference behind `weak` to go away,
/// checking every `poll`.
///
/// Returns true if the referent was released in time.
pub fn await_release<T: ?Sized>(weak: &Weak<T>, window: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + window;
    let poll = poll.max(Duration::from_millis(1));
    loop {
        if weak.strong_count() == 0 {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}
