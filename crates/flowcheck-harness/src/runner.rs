//! Executing rule registries and reporting outcomes.
//!
//! The runner owns the per-rule protocol: clear the failure sink, run the
//! scenario with panics caught, fold in whatever the callbacks recorded
//! asynchronously, then map the result onto the rule's level. Optional rules
//! turn violations into skips; nothing else is ever downgraded.

use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
};

use flowcheck_core::TestEnvironment;
use serde::Serialize;

use crate::rule::{Rule, RuleBody, RuleLevel, RuleRegistry, Scenario, ScenarioError};

/// Result of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RuleOutcome {
    /// The implementation satisfied the rule.
    Passed,
    /// The implementation violated the rule.
    Failed(String),
    /// The rule was not checked, with the reason.
    Skipped(String),
}

impl RuleOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Passed => "PASS",
            Self::Failed(_) => "FAIL",
            Self::Skipped(_) => "SKIP",
        }
    }
}

/// Outcome of one rule plus its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleReport {
    /// Unique rule name, prefixed by its sub-suite when merged.
    pub name: String,
    /// Rule-book identifier.
    pub rule: &'static str,
    /// Requirement level.
    pub level: RuleLevel,
    /// What the scenario checks.
    pub description: &'static str,
    /// What happened.
    pub outcome: RuleOutcome,
}

/// Outcomes of a whole suite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SuiteReport {
    /// Suite name.
    pub suite: String,
    /// One report per rule, in registry order.
    pub rules: Vec<RuleReport>,
}

impl SuiteReport {
    /// Create an empty report.
    pub fn new(suite: impl Into<String>) -> Self {
        Self { suite: suite.into(), rules: Vec::new() }
    }

    /// Append the rules of `other`, prefixing their names with `prefix::`.
    pub fn merge(&mut self, prefix: &str, other: SuiteReport) {
        self.rules.extend(other.rules.into_iter().map(|mut report| {
            report.name = format!("{prefix}::{}", report.name);
            report
        }));
    }

    /// Report for the rule called `name`.
    pub fn get(&self, name: &str) -> Option<&RuleReport> {
        self.rules.iter().find(|report| report.name == name)
    }

    fn count(&self, predicate: impl Fn(&RuleOutcome) -> bool) -> usize {
        self.rules.iter().filter(|report| predicate(&report.outcome)).count()
    }

    /// Number of passed rules.
    pub fn passed(&self) -> usize {
        self.count(|outcome| matches!(outcome, RuleOutcome::Passed))
    }

    /// Number of failed rules.
    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, RuleOutcome::Failed(_)))
    }

    /// Number of skipped rules.
    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, RuleOutcome::Skipped(_)))
    }

    /// Reports of the failed rules.
    pub fn failures(&self) -> impl Iterator<Item = &RuleReport> {
        self.rules.iter().filter(|report| matches!(report.outcome, RuleOutcome::Failed(_)))
    }

    /// Returns true if no rule failed.
    pub fn is_conformant(&self) -> bool {
        self.failed() == 0
    }

    /// Panic listing every failed rule.
    ///
    /// Use this from a `#[test]` to fail it with full context.
    #[track_caller]
    #[allow(clippy::panic)]
    pub fn assert_conformant(&self) {
        if !self.is_conformant() {
            let messages: Vec<_> = self
                .failures()
                .map(|report| match &report.outcome {
                    RuleOutcome::Failed(reason) => {
                        format!("{} ({}): {reason}", report.name, report.rule)
                    },
                    RuleOutcome::Passed | RuleOutcome::Skipped(_) => report.name.clone(),
                })
                .collect();
            let count = messages.len();
            panic!("{} violated {count} rule(s):\n  {}", self.suite, messages.join("\n  "));
        }
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.rules {
            write!(f, "[{}] {:<6} {}", report.outcome.label(), report.rule, report.name)?;
            match &report.outcome {
                RuleOutcome::Passed => writeln!(f)?,
                RuleOutcome::Failed(detail) | RuleOutcome::Skipped(detail) => {
                    writeln!(f, ": {detail}")?;
                },
            }
        }
        write!(
            f,
            "{}: {} passed, {} failed, {} skipped",
            self.suite,
            self.passed(),
            self.failed(),
            self.skipped()
        )
    }
}

/// Knobs that decide which rules run and how often.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    /// Skip every stochastic rule.
    pub skip_stochastic: bool,
    /// Repetitions of each stochastic rule.
    pub stochastic_repetitions: u32,
    /// Concurrent subscribers the implementation supports.
    pub max_supported_subscribers: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            skip_stochastic: false,
            stochastic_repetitions: 100,
            max_supported_subscribers: usize::MAX,
        }
    }
}

enum Attempt {
    Passed,
    Error(ScenarioError),
    Panicked(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn attempt<C>(env: &TestEnvironment, scenario: Scenario<C>, ctx: &C) -> Attempt {
    env.clear_async_errors();
    match catch_unwind(AssertUnwindSafe(|| scenario(ctx))) {
        Ok(Ok(())) => match env.verify_no_async_errors_no_delay() {
            Ok(()) => Attempt::Passed,
            Err(failure) => Attempt::Error(ScenarioError::Violation(failure)),
        },
        Ok(Err(err)) => Attempt::Error(err),
        Err(payload) => Attempt::Panicked(panic_message(payload.as_ref())),
    }
}

fn resolve(level: RuleLevel, attempt: Attempt) -> RuleOutcome {
    match attempt {
        Attempt::Passed => RuleOutcome::Passed,
        Attempt::Error(ScenarioError::NotVerified(reason)) => RuleOutcome::Skipped(reason),
        Attempt::Error(ScenarioError::Violation(failure)) if level == RuleLevel::Optional => {
            RuleOutcome::Skipped(format!("optional capability not present: {failure}"))
        },
        Attempt::Error(ScenarioError::Violation(failure)) => {
            RuleOutcome::Failed(failure.to_string())
        },
        Attempt::Error(ScenarioError::Harness(message)) => {
            RuleOutcome::Failed(format!("harness error: {message}"))
        },
        Attempt::Panicked(message) => RuleOutcome::Failed(format!("scenario panicked: {message}")),
    }
}

fn execute<C>(
    env: &TestEnvironment,
    rule: &Rule<C>,
    ctx: &C,
    settings: &RunSettings,
) -> RuleOutcome {
    let scenario = match rule.body {
        RuleBody::Untested(reason) => return RuleOutcome::Skipped(reason.to_string()),
        RuleBody::Scenario(scenario) => scenario,
    };

    if rule.required_subscribers > settings.max_supported_subscribers {
        return RuleOutcome::Skipped(format!(
            "requires {} concurrent subscribers, implementation supports {}",
            rule.required_subscribers, settings.max_supported_subscribers
        ));
    }

    if rule.level != RuleLevel::Stochastic {
        return resolve(rule.level, attempt(env, scenario, ctx));
    }

    if settings.skip_stochastic {
        return RuleOutcome::Skipped("stochastic rules are disabled".to_string());
    }

    let repetitions = settings.stochastic_repetitions.max(1);
    for iteration in 1..=repetitions {
        match resolve(rule.level, attempt(env, scenario, ctx)) {
            RuleOutcome::Passed => {},
            RuleOutcome::Failed(reason) => {
                return RuleOutcome::Failed(format!(
                    "iteration {iteration} of {repetitions}: {reason}"
                ));
            },
            skipped @ RuleOutcome::Skipped(_) => return skipped,
        }
    }
    RuleOutcome::Passed
}

/// Run one rule and report its outcome.
pub fn run_rule<C>(
    suite: &str,
    env: &TestEnvironment,
    rule: &Rule<C>,
    ctx: &C,
    settings: &RunSettings,
) -> RuleReport {
    tracing::debug!(suite, rule = rule.id, name = rule.name, "running rule");
    let outcome = execute(env, rule, ctx, settings);
    env.clear_async_errors();

    match &outcome {
        RuleOutcome::Passed => tracing::info!(suite, rule = rule.id, name = rule.name, "passed"),
        RuleOutcome::Skipped(reason) => {
            tracing::info!(suite, rule = rule.id, name = rule.name, %reason, "skipped");
        },
        RuleOutcome::Failed(reason) => {
            tracing::warn!(suite, rule = rule.id, name = rule.name, %reason, "failed");
        },
    }

    RuleReport {
        name: rule.name.to_string(),
        rule: rule.id,
        level: rule.level,
        description: rule.description,
        outcome,
    }
}

/// Run every rule of `registry` in order.
pub fn run_registry<C>(
    suite: &str,
    env: &TestEnvironment,
    registry: &RuleRegistry<C>,
    ctx: &C,
    settings: &RunSettings,
) -> SuiteReport {
    let mut report = SuiteReport::new(suite);
    report.rules = registry.iter().map(|rule| run_rule(suite, env, rule, ctx, settings)).collect();
    tracing::info!(
        suite,
        passed = report.passed(),
        failed = report.failed(),
        skipped = report.skipped(),
        "suite finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use flowcheck_core::EnvironmentConfig;

    use super::*;
    use crate::rule::ScenarioResult;

    struct Ctx {
        env: Arc<TestEnvironment>,
    }

    fn ctx() -> Ctx {
        Ctx {
            env: TestEnvironment::new(
                EnvironmentConfig::default().with_no_signals_timeout(Duration::from_millis(5)),
            ),
        }
    }

    fn passes(_ctx: &Ctx) -> ScenarioResult {
        Ok(())
    }

    fn violates(_ctx: &Ctx) -> ScenarioResult {
        Err(ScenarioError::violation("emitted without demand"))
    }

    fn flops(ctx: &Ctx) -> ScenarioResult {
        ctx.env.flop("late on_next");
        Ok(())
    }

    fn misconfigured(_ctx: &Ctx) -> ScenarioResult {
        Err(ScenarioError::Harness("max elements must be at least 1".to_string()))
    }

    #[allow(clippy::panic)]
    fn panics(_ctx: &Ctx) -> ScenarioResult {
        panic!("factory blew up")
    }

    fn outcome_of(rule: Rule<Ctx>, settings: RunSettings) -> RuleOutcome {
        let ctx = ctx();
        run_rule("unit", &ctx.env, &rule, &ctx, &settings).outcome
    }

    #[test]
    fn async_flops_fail_a_passing_scenario() {
        let outcome = outcome_of(Rule::required("1.1", "r", "", flops), RunSettings::default());
        assert_eq!(outcome, RuleOutcome::Failed("late on_next".to_string()));
    }

    #[test]
    fn optional_downgrades_only_violations() {
        let settings = RunSettings::default();
        assert!(matches!(
            outcome_of(Rule::optional("1.4", "a", "", violates), settings),
            RuleOutcome::Skipped(_)
        ));
        assert!(matches!(
            outcome_of(Rule::optional("1.4", "b", "", misconfigured), settings),
            RuleOutcome::Failed(_)
        ));
        assert!(matches!(
            outcome_of(Rule::optional("1.4", "c", "", panics), settings),
            RuleOutcome::Failed(reason) if reason.contains("factory blew up")
        ));
    }

    #[test]
    fn stochastic_failures_name_the_iteration() {
        let settings = RunSettings { stochastic_repetitions: 3, ..RunSettings::default() };
        let outcome = outcome_of(Rule::stochastic("1.3", "s", "", violates), settings);
        assert_eq!(
            outcome,
            RuleOutcome::Failed("iteration 1 of 3: emitted without demand".to_string())
        );

        let skip = RunSettings { skip_stochastic: true, ..settings };
        let outcome = outcome_of(Rule::stochastic("1.3", "s", "", passes), skip);
        assert!(matches!(outcome, RuleOutcome::Skipped(_)));
    }

    #[test]
    fn multi_subscriber_rules_skip_when_unsupported() {
        let settings = RunSettings { max_supported_subscribers: 2, ..RunSettings::default() };
        let rule = Rule::optional("1.11", "m", "", passes).with_subscribers(3);
        assert!(matches!(outcome_of(rule, settings), RuleOutcome::Skipped(_)));

        let rule = Rule::optional("1.11", "m", "", passes).with_subscribers(3);
        assert_eq!(outcome_of(rule, RunSettings::default()), RuleOutcome::Passed);
    }

    #[test]
    fn report_counts_and_merges() {
        let ctx = ctx();
        let mut registry = RuleRegistry::new();
        registry.add(Rule::required("1.1", "ok", "", passes));
        registry.add(Rule::required("1.2", "bad", "", violates));
        registry.add(Rule::untested("1.6", "manual", "", "not observable"));

        let inner = run_registry("inner", &ctx.env, &registry, &ctx, &RunSettings::default());
        assert_eq!((inner.passed(), inner.failed(), inner.skipped()), (1, 1, 1));
        assert!(!inner.is_conformant());

        let mut outer = SuiteReport::new("outer");
        outer.merge("publisher", inner);
        assert!(outer.get("publisher::bad").is_some());
        assert!(outer.to_string().ends_with("outer: 1 passed, 1 failed, 1 skipped"));
    }
}
