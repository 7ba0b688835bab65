//! Verification core for backpressured stream implementations.
//!
//! Everything the rule suites need to observe an implementation under test
//! from the outside, without ever blocking forever and without ever throwing
//! into the implementation's own threads.
//!
//! # Layers
//!
//! - [`env`]: configuration and the shared failure sink ("flops").
//! - [`sync`]: [`Latch`], [`Promise`] and [`Receptacle`], the only places the
//!   harness waits, always with a deadline.
//! - [`doubles`]: reference [`ManualPublisher`] / [`ManualSubscriber`] that
//!   drive or observe the implementation under test, plus the background
//!   [`HelperPublisher`] that generates elements.
//! - [`probe`]: wrappers that record what a subscriber under test sees
//!   ([`BlackboxProbe`]) or additionally steer it ([`WhiteboxSubscriberProbe`]).
//! - [`signal`]: per-thread signal scopes and the concurrent-access barrier.
//! - [`reference`]: observing that a publisher released its subscriber.
//!
//! # Failure channels
//!
//! Callback-side checks record a [`Failure`] in the environment and return.
//! Blocking expectations on the driving thread record the failure and also
//! return it, so scenario code can propagate it with `?`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod doubles;
pub mod env;
pub mod error;
pub mod probe;
pub mod reference;
pub mod signal;
pub mod sync;

use std::fmt::Debug;

pub use doubles::{ElementFactory, HelperPublisher, ManualPublisher, ManualSubscriber};
pub use env::{EnvironmentConfig, TEST_BUFFER_SIZE, TestEnvironment};
pub use error::{ConfigError, Failure};
pub use probe::{BlackboxProbe, BlackboxSubscriberProxy, SubscriberPuppet, WhiteboxSubscriberProbe};
pub use reference::await_release;
pub use signal::{ConcurrentAccessBarrier, Signal, SignalScope};
pub use sync::{Delivery, Latch, Promise, Receptacle};

/// Bounds every element type flowing through the harness.
///
/// Elements are compared (ordering and identity checks), printed in failure
/// messages, and handed across threads.
pub trait Element: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T> Element for T where T: Clone + PartialEq + Debug + Send + Sync + 'static {}
