//! Rule registry.
//!
//! Every suite is a flat list of [`Rule`]s: an identifier from the protocol
//! rule book, a unique name, a requirement level and either a scenario
//! function or the reason the rule cannot be checked mechanically. The
//! runner executes any registry the same way, whichever role is under test.

use std::fmt;

use flowcheck_core::Failure;
use serde::Serialize;
use thiserror::Error;

/// How a rule's outcome counts towards conformance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleLevel {
    /// Must pass.
    Required,
    /// Violations are reported as skipped: the capability is optional.
    Optional,
    /// Cannot be checked mechanically; always skipped.
    Untested,
    /// Repeated many times, every repetition must pass.
    Stochastic,
}

impl fmt::Display for RuleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => write!(f, "required"),
            Self::Optional => write!(f, "optional"),
            Self::Untested => write!(f, "untested"),
            Self::Stochastic => write!(f, "stochastic"),
        }
    }
}

/// Why a scenario did not pass.
#[derive(Error, Debug, Clone)]
pub enum ScenarioError {
    /// The implementation under test violated the rule.
    ///
    /// The only variant an optional rule downgrades to a skip.
    #[error(transparent)]
    Violation(#[from] Failure),

    /// The scenario does not apply to the implementation under test.
    #[error("not verified: {0}")]
    NotVerified(String),

    /// The harness itself was misconfigured.
    #[error("harness error: {0}")]
    Harness(String),
}

impl ScenarioError {
    /// Skip with `reason`.
    pub fn not_verified(reason: impl Into<String>) -> Self {
        Self::NotVerified(reason.into())
    }

    /// Fail with a violation described by `message`.
    pub fn violation(message: impl Into<String>) -> Self {
        Self::Violation(Failure::assertion(message))
    }
}

/// Result of one scenario run.
pub type ScenarioResult = Result<(), ScenarioError>;

/// Scenario body run against a suite context `C`.
pub type Scenario<C> = fn(&C) -> ScenarioResult;

/// What running a rule does.
pub enum RuleBody<C> {
    /// Execute this scenario.
    Scenario(Scenario<C>),
    /// Skip, for this reason.
    Untested(&'static str),
}

/// One protocol rule and the scenario checking it.
pub struct Rule<C> {
    /// Rule-book identifier, e.g. `"3.9"`.
    pub id: &'static str,
    /// Unique name within the suite.
    pub name: &'static str,
    /// What the scenario checks.
    pub description: &'static str,
    /// Requirement level.
    pub level: RuleLevel,
    /// Concurrent subscribers the scenario needs; `1` for most rules.
    pub required_subscribers: usize,
    /// The check.
    pub body: RuleBody<C>,
}

/// Listing entry for a registered rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleInfo {
    /// Rule-book identifier.
    pub id: &'static str,
    /// Unique name within the suite.
    pub name: String,
    /// Requirement level.
    pub level: RuleLevel,
    /// What the scenario checks.
    pub description: &'static str,
}

impl<C> Rule<C> {
    fn with_body(
        id: &'static str,
        name: &'static str,
        level: RuleLevel,
        description: &'static str,
        body: RuleBody<C>,
    ) -> Self {
        Self { id, name, description, level, required_subscribers: 1, body }
    }

    /// A rule that must pass.
    pub fn required(
        id: &'static str,
        name: &'static str,
        description: &'static str,
        scenario: Scenario<C>,
    ) -> Self {
        Self::with_body(id, name, RuleLevel::Required, description, RuleBody::Scenario(scenario))
    }

    /// A rule whose violations are reported as skips.
    pub fn optional(
        id: &'static str,
        name: &'static str,
        description: &'static str,
        scenario: Scenario<C>,
    ) -> Self {
        Self::with_body(id, name, RuleLevel::Optional, description, RuleBody::Scenario(scenario))
    }

    /// A rule repeated for every stochastic repetition.
    pub fn stochastic(
        id: &'static str,
        name: &'static str,
        description: &'static str,
        scenario: Scenario<C>,
    ) -> Self {
        Self::with_body(id, name, RuleLevel::Stochastic, description, RuleBody::Scenario(scenario))
    }

    /// A rule the harness cannot check.
    pub fn untested(
        id: &'static str,
        name: &'static str,
        description: &'static str,
        reason: &'static str,
    ) -> Self {
        Self::with_body(id, name, RuleLevel::Untested, description, RuleBody::Untested(reason))
    }

    /// Require `count` concurrent subscribers.
    #[must_use]
    pub fn with_subscribers(mut self, count: usize) -> Self {
        self.required_subscribers = count;
        self
    }

    /// Listing entry for this rule.
    pub fn info(&self) -> RuleInfo {
        RuleInfo {
            id: self.id,
            name: self.name.to_string(),
            level: self.level,
            description: self.description,
        }
    }
}

/// Ordered collection of the rules of one suite.
pub struct RuleRegistry<C> {
    rules: Vec<Rule<C>>,
}

impl<C> Default for RuleRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> RuleRegistry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule.
    pub fn add(&mut self, rule: Rule<C>) {
        debug_assert!(
            self.rules.iter().all(|existing| existing.name != rule.name),
            "duplicate rule name {}",
            rule.name
        );
        self.rules.push(rule);
    }

    /// Look a rule up by name.
    pub fn get(&self, name: &str) -> Option<&Rule<C>> {
        self.rules.iter().find(|rule| rule.name == name)
    }

    /// Registered rules in order.
    pub fn iter(&self) -> impl Iterator<Item = &Rule<C>> {
        self.rules.iter()
    }

    /// Listing of the registered rules.
    pub fn infos(&self) -> Vec<RuleInfo> {
        self.rules.iter().map(Rule::info).collect()
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
