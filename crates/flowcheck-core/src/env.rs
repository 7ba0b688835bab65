//! Test environment: timeouts and the asynchronous failure sink.
//!
//! One [`TestEnvironment`] exists per test run. Every test double, probe and
//! primitive holds an `Arc` to it and records failures ("flops") into it from
//! whichever thread observed the violation. The scenario driver clears the
//! sink before each scenario and drains it at check points.
//!
//! # Failure recording
//!
//! - [`TestEnvironment::flop`]: record and return. Safe on any thread,
//!   including threads owned by the implementation under test.
//! - [`TestEnvironment::flop_and_fail`]: record and hand the failure back so
//!   the driving thread can abort the scenario with `?`.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use flowcheck_proto::SignalError;
use parking_lot::{Condvar, Mutex};

use crate::error::{ConfigError, Failure};

/// Wait used for every expected signal unless a scenario says otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Window a publisher gets to release a cancelled subscriber.
pub const DEFAULT_PUBLISHER_REFERENCE_GC_TIMEOUT: Duration = Duration::from_millis(300);

/// Element count test doubles assume a stage can buffer.
pub const TEST_BUFFER_SIZE: usize = 16;

/// Timeouts and flags for one test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// How long to wait for a signal that must arrive.
    pub default_timeout: Duration,
    /// How long to watch for signals that must not arrive.
    pub default_no_signals_timeout: Duration,
    /// Upper bound between two checks of the failure sink.
    pub default_poll_interval: Duration,
    /// How long a publisher may hold on to a cancelled subscriber.
    pub publisher_reference_gc_timeout: Duration,
    /// Log harness debug output at `info` instead of `debug`.
    pub debug: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            default_no_signals_timeout: DEFAULT_TIMEOUT,
            default_poll_interval: DEFAULT_TIMEOUT,
            publisher_reference_gc_timeout: DEFAULT_PUBLISHER_REFERENCE_GC_TIMEOUT,
            debug: false,
        }
    }
}

impl EnvironmentConfig {
    /// Overrides [`EnvironmentConfig::default_timeout`].
    pub const TIMEOUT_VAR: &'static str = "DEFAULT_TIMEOUT_MILLIS";
    /// Overrides [`EnvironmentConfig::default_no_signals_timeout`].
    pub const NO_SIGNALS_TIMEOUT_VAR: &'static str = "DEFAULT_NO_SIGNALS_TIMEOUT_MILLIS";
    /// Overrides [`EnvironmentConfig::default_poll_interval`].
    pub const POLL_TIMEOUT_VAR: &'static str = "DEFAULT_POLL_TIMEOUT_MILLIS";
    /// Overrides [`EnvironmentConfig::publisher_reference_gc_timeout`].
    pub const GC_TIMEOUT_VAR: &'static str = "PUBLISHER_REFERENCE_GC_TIMEOUT_MILLIS";
    /// Overrides [`EnvironmentConfig::debug`].
    pub const DEBUG_VAR: &'static str = "FLOWCHECK_DEBUG";

    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`.
    ///
    /// The no-signals timeout and the poll interval follow the default
    /// timeout unless set explicitly.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_timeout = parse_millis(&lookup, Self::TIMEOUT_VAR)?.unwrap_or(DEFAULT_TIMEOUT);
        let default_no_signals_timeout =
            parse_millis(&lookup, Self::NO_SIGNALS_TIMEOUT_VAR)?.unwrap_or(default_timeout);
        let default_poll_interval =
            parse_millis(&lookup, Self::POLL_TIMEOUT_VAR)?.unwrap_or(default_timeout);
        let publisher_reference_gc_timeout = parse_millis(&lookup, Self::GC_TIMEOUT_VAR)?
            .unwrap_or(DEFAULT_PUBLISHER_REFERENCE_GC_TIMEOUT);
        let debug = parse_flag(&lookup, Self::DEBUG_VAR)?.unwrap_or(false);

        Ok(Self {
            default_timeout,
            default_no_signals_timeout,
            default_poll_interval,
            publisher_reference_gc_timeout,
            debug,
        })
    }

    /// Set the default signal timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the "expect nothing further" window.
    #[must_use]
    pub fn with_no_signals_timeout(mut self, timeout: Duration) -> Self {
        self.default_no_signals_timeout = timeout;
        self
    }

    /// Set the failure-sink poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.default_poll_interval = interval;
        self
    }

    /// Set the reference-release window.
    #[must_use]
    pub fn with_publisher_reference_gc_timeout(mut self, timeout: Duration) -> Self {
        self.publisher_reference_gc_timeout = timeout;
        self
    }

    /// Enable or disable debug output.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

fn parse_millis<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|millis| Some(Duration::from_millis(millis)))
            .map_err(|_| ConfigError::InvalidMillis { key, value: raw }),
    }
}

fn parse_flag<F>(lookup: &F, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidFlag { key, value: raw }),
        },
    }
}

/// Shared configuration plus the failure sink for one test run.
///
/// The sink takes appends from arbitrary signal-delivery threads and is
/// drained by the single scenario-driving thread.
pub struct TestEnvironment {
    config: EnvironmentConfig,
    failures: Mutex<VecDeque<Failure>>,
    arrived: Condvar,
}

impl std::fmt::Debug for TestEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnvironment")
            .field("config", &self.config)
            .field("pending_failures", &self.async_error_count())
            .finish()
    }
}

impl TestEnvironment {
    /// Create an environment with the given configuration.
    pub fn new(config: EnvironmentConfig) -> Arc<Self> {
        Arc::new(Self { config, failures: Mutex::new(VecDeque::new()), arrived: Condvar::new() })
    }

    /// Create an environment configured from the process environment.
    pub fn from_env() -> Result<Arc<Self>, ConfigError> {
        EnvironmentConfig::from_env().map(Self::new)
    }

    /// Configuration of this run.
    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Wait for signals that must arrive.
    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout
    }

    /// Window for signals that must not arrive.
    pub fn default_no_signals_timeout(&self) -> Duration {
        self.config.default_no_signals_timeout
    }

    /// Upper bound between two checks of the failure sink.
    pub fn default_poll_interval(&self) -> Duration {
        self.config.default_poll_interval
    }

    /// Reference-release window for cancelled subscribers.
    pub fn publisher_reference_gc_timeout(&self) -> Duration {
        self.config.publisher_reference_gc_timeout
    }

    /// Record a failure without interrupting the caller.
    pub fn flop(&self, message: impl Into<String>) {
        self.record(Failure::Assertion(message.into()));
    }

    /// Record an error signalled by the implementation under test.
    pub fn flop_signal(&self, cause: SignalError, message: impl Into<String>) {
        self.record(Failure::Signal { message: message.into(), cause });
    }

    /// Record an already-built failure.
    pub fn record(&self, failure: Failure) {
        tracing::warn!(failure = %failure, "flop");
        self.failures.lock().push_back(failure);
        self.arrived.notify_all();
    }

    /// Record a failure and return it for the driving thread to propagate.
    pub fn flop_and_fail(&self, message: impl Into<String>) -> Failure {
        self.fail(Failure::Assertion(message.into()))
    }

    /// Record `failure` and return it for the driving thread to propagate.
    pub fn fail(&self, failure: Failure) -> Failure {
        self.record(failure.clone());
        failure
    }

    /// Emit harness debug output.
    pub fn debug(&self, message: impl AsRef<str>) {
        if self.config.debug {
            tracing::info!(target: "flowcheck", "{}", message.as_ref());
        } else {
            tracing::debug!(target: "flowcheck", "{}", message.as_ref());
        }
    }

    /// Wait the no-signals window, then fail with the first recorded failure.
    pub fn verify_no_async_errors(&self) -> Result<(), Failure> {
        self.verify_no_async_errors_after(self.config.default_no_signals_timeout)
    }

    /// Wait `delay`, then fail with the first recorded failure.
    pub fn verify_no_async_errors_after(&self, delay: Duration) -> Result<(), Failure> {
        std::thread::sleep(delay);
        self.verify_no_async_errors_no_delay()
    }

    /// Fail with the first recorded failure, without waiting.
    pub fn verify_no_async_errors_no_delay(&self) -> Result<(), Failure> {
        match self.failures.lock().front() {
            Some(first) => Err(first.clone()),
            None => Ok(()),
        }
    }

    /// Forget every recorded failure.
    pub fn clear_async_errors(&self) {
        self.failures.lock().clear();
    }

    /// Remove and return the oldest recorded failure.
    pub fn drop_async_error(&self) -> Option<Failure> {
        self.failures.lock().pop_front()
    }

    /// Snapshot of the recorded failures, oldest first.
    pub fn async_errors(&self) -> Vec<Failure> {
        self.failures.lock().iter().cloned().collect()
    }

    /// Number of recorded failures.
    pub fn async_error_count(&self) -> usize {
        self.failures.lock().len()
    }

    /// Wait for the implementation to signal an error of kind `E`.
    ///
    /// Takes the oldest recorded failure once one arrives. Succeeds if it
    /// carries an error of kind `E`, fails with the expected-vs-actual detail
    /// otherwise. Waits at most `total_timeout`, re-checking at least every
    /// `poll_interval`.
    pub fn expect_error<E>(
        &self,
        total_timeout: Duration,
        poll_interval: Duration,
        message: &str,
    ) -> Result<SignalError, Failure>
    where
        E: std::error::Error + 'static,
    {
        let deadline = Instant::now() + total_timeout;
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        let mut failures = self.failures.lock();

        loop {
            if let Some(found) = failures.pop_front() {
                drop(failures);
                return match found.cause() {
                    Some(cause) if cause.downcast_ref::<E>().is_some() => Ok(cause.clone()),
                    _ => Err(self.flop_and_fail(format!(
                        "{message}: expected an error of kind {} but got [{found}]",
                        std::any::type_name::<E>()
                    ))),
                };
            }

            let now = Instant::now();
            if now >= deadline {
                drop(failures);
                return Err(self.flop_and_fail(format!(
                    "{message}: no error of kind {} within {total_timeout:?}",
                    std::any::type_name::<E>()
                )));
            }

            let _ = self.arrived.wait_for(&mut failures, poll_interval.min(deadline - now));
        }
    }

    /// Like [`TestEnvironment::expect_error`] with the default timeouts,
    /// additionally requiring the error message to mention one of
    /// `required_parts`.
    pub fn expect_error_with_message<E>(
        &self,
        required_parts: &[&str],
        message: &str,
    ) -> Result<SignalError, Failure>
    where
        E: std::error::Error + 'static,
    {
        let cause = self.expect_error::<E>(
            self.config.default_timeout,
            self.config.default_poll_interval,
            message,
        )?;
        check_error_message(self, &cause, required_parts)?;
        Ok(cause)
    }
}

/// Fail unless `cause`'s message contains at least one of `required_parts`.
pub(crate) fn check_error_message(
    env: &TestEnvironment,
    cause: &SignalError,
    required_parts: &[&str],
) -> Result<(), Failure> {
    let text = cause.to_string();
    if required_parts.is_empty() || required_parts.iter().any(|part| text.contains(part)) {
        Ok(())
    } else {
        Err(env.flop_and_fail(format!(
            "got expected error kind, but its message [{text}] mentions none of {required_parts:?}"
        )))
    }
}
