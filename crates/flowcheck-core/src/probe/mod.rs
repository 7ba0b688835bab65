//! Observation of a subscriber under test.
//!
//! A blackbox probe only sees the signals delivered to the subscriber. A
//! whitebox probe is additionally handed a [`SubscriberPuppet`] by the
//! subscriber under test, through which a scenario can make the subscriber
//! request or cancel on command.

mod blackbox;
mod whitebox;

pub use blackbox::{BlackboxProbe, BlackboxSubscriberProxy};
pub use whitebox::{SubscriberPuppet, WhiteboxSubscriberProbe};
