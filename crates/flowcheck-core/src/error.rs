//! Error types for the verification core.
//!
//! A [`Failure`] is what the harness records when an implementation under
//! test misbehaves. Failures are values, not panics: they are captured from
//! whatever thread observed them and surfaced later on the driving thread.

use flowcheck_proto::SignalError;
use thiserror::Error;

/// A protocol violation or failed expectation.
#[derive(Error, Debug, Clone)]
pub enum Failure {
    /// An expectation did not hold.
    #[error("{0}")]
    Assertion(String),

    /// An error signalled by the implementation under test, captured where
    /// the harness did not expect one.
    #[error("{message}: {cause}")]
    Signal {
        /// What the harness was doing when the error arrived
        message: String,
        /// The captured error
        cause: SignalError,
    },

    /// A buffer of observed signals filled up, meaning the producer emitted
    /// far more than was ever requested.
    #[error("{context}: more than {capacity} signals buffered without being consumed")]
    Overflow {
        /// Which buffer overflowed
        context: String,
        /// Capacity that was exceeded
        capacity: usize,
    },
}

impl Failure {
    /// Build an assertion failure from anything printable.
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }

    /// The captured foreign error, if this failure carries one.
    pub fn cause(&self) -> Option<&SignalError> {
        match self {
            Self::Signal { cause, .. } => Some(cause),
            Self::Assertion(_) | Self::Overflow { .. } => None,
        }
    }

    /// Returns true if the captured error is of kind `E`.
    pub fn is_caused_by<E>(&self) -> bool
    where
        E: std::error::Error + 'static,
    {
        self.cause().is_some_and(|cause| cause.downcast_ref::<E>().is_some())
    }
}

/// Errors reading the environment configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A timeout variable was not a non-negative integer.
    #[error("{key} must be a whole number of milliseconds, got {value:?}")]
    InvalidMillis {
        /// Variable name
        key: &'static str,
        /// Raw value found
        value: String,
    },

    /// A flag variable was not a recognised boolean.
    #[error("{key} must be one of true/false/1/0, got {value:?}")]
    InvalidFlag {
        /// Variable name
        key: &'static str,
        /// Raw value found
        value: String,
    },
}
