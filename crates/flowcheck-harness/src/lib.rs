//! Rule suites for backpressured stream implementations.
//!
//! Each suite takes a factory for the implementation under test and runs one
//! scenario per protocol rule, on top of the observation layer in
//! [`flowcheck_core`]:
//!
//! - [`PublisherVerification`] for publishers.
//! - [`SubscriberWhiteboxVerification`] for subscribers that expose a puppet.
//! - [`SubscriberBlackboxVerification`] for subscribers that do not.
//! - [`IdentityProcessorVerification`] for pass-through processors, which
//!   also runs the publisher and whitebox subscriber suites against them.
//!
//! # Outcomes
//!
//! Every rule ends as passed, failed or skipped. Required and stochastic
//! rules fail on any violation. Optional rules report a violation as a
//! missing capability and are skipped. Untested rules are always skipped
//! with the reason they cannot be checked mechanically.
//!
//! ```ignore
//! let env = TestEnvironment::from_env()?;
//! let report = SubscriberWhiteboxVerification::new(env, Arc::new(MyFactory)).run();
//! tracing::info!("{report}");
//! report.assert_conformant();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod processor;
pub mod publisher;
pub mod rule;
pub mod runner;
pub mod subscriber;

use std::sync::Arc;

use flowcheck_proto::SignalError;
use thiserror::Error;

pub use processor::{IdentityProcessorVerification, ProcessorFactory};
pub use publisher::{
    PublisherCapabilities, PublisherFactory, PublisherVerification, UNBOUNDED_ELEMENTS,
};
pub use rule::{Rule, RuleInfo, RuleLevel, RuleRegistry, ScenarioError, ScenarioResult};
pub use runner::{RuleOutcome, RuleReport, RunSettings, SuiteReport};
pub use subscriber::{
    BlackboxSubscriberFactory, SubscriberBlackboxVerification, SubscriberWhiteboxVerification,
    WhiteboxSubscriberFactory,
};

/// Error the harness itself signals into an implementation under test.
///
/// Scenarios check that exactly this instance comes back out, by pointer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("test error signalled by the harness")]
pub struct TestSignalError;

impl TestSignalError {
    /// A fresh instance as a [`SignalError`].
    pub fn signal() -> SignalError {
        Arc::new(Self)
    }
}
