//! Timeout-bounded coordination primitives.
//!
//! These are the only places the harness suspends. Every wait carries a
//! deadline; a wait that runs out records a failure in the environment and
//! hands it back, so a hung implementation under test produces a bounded-time
//! scenario failure instead of a stuck harness.
//!
//! - [`Latch`]: proves that an event happened (once).
//! - [`Promise`]: a single value, assigned once.
//! - [`Receptacle`]: a bounded FIFO of elements terminated by end-of-stream.

mod latch;
mod promise;
mod receptacle;

pub use latch::Latch;
pub use promise::Promise;
pub use receptacle::{Delivery, Receptacle};
