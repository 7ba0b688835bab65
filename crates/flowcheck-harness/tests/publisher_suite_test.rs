//! Publisher suite against reference publishers
//!
//! Verifies:
//! - A correct publisher passes every rule it can be checked against
//! - Multi-subscriber rules run once enough subscribers are declared, and by
//!   default when a factory declares nothing
//! - Each deliberate flaw is reported against the rule it breaks
//! - A missing failed publisher skips, rather than fails, the rules needing one

#[allow(dead_code)]
mod support;

use std::sync::Arc;

use flowcheck_harness::{PublisherFactory, PublisherVerification, RuleOutcome};
use flowcheck_proto::Publisher;
use support::{PublisherFlaw, RangePublisher, RangePublishers};

fn suite(factory: Arc<RangePublishers>) -> PublisherVerification<u64> {
    PublisherVerification::new(support::env(), factory)
}

fn outcome(factory: Arc<RangePublishers>, rule: &str) -> RuleOutcome {
    suite(factory).run_rule(rule).expect("rule exists").outcome
}

fn failure_reason(outcome: RuleOutcome) -> String {
    match outcome {
        RuleOutcome::Failed(reason) => reason,
        other => panic!("expected a failure, got {other:?}"),
    }
}

/// Range publishers with every capability left at its default.
struct DefaultRangePublishers;

impl PublisherFactory<u64> for DefaultRangePublishers {
    fn create_publisher(&self, elements: u64) -> Arc<dyn Publisher<u64>> {
        RangePublisher::new(elements, PublisherFlaw::None)
    }
}

#[test]
fn correct_publisher_is_conformant() {
    let report = suite(RangePublishers::correct()).run();
    report.assert_conformant();

    let multicast = report
        .get("multicast_same_elements_in_same_sequence_when_requesting_one_by_one")
        .expect("rule reported");
    assert_eq!(multicast.outcome, RuleOutcome::Passed);

    let untested = report.get("subscribe_must_reject_null_subscriber").expect("rule reported");
    assert!(matches!(untested.outcome, RuleOutcome::Skipped(_)));
}

#[test]
fn ignoring_request_zero_is_detected() {
    let outcome = outcome(
        RangePublishers::flawed(PublisherFlaw::IgnoresIllegalRequests),
        "request_zero_must_signal_non_positive_request",
    );
    assert!(matches!(outcome, RuleOutcome::Failed(_)), "{outcome:?}");
}

#[test]
fn ignoring_request_zero_only_skips_the_optional_message_rule() {
    let outcome = outcome(
        RangePublishers::flawed(PublisherFlaw::IgnoresIllegalRequests),
        "request_negative_number_may_signal_error_with_specific_message",
    );
    assert!(matches!(outcome, RuleOutcome::Skipped(_)), "{outcome:?}");
}

#[test]
fn emitting_without_demand_is_detected() {
    let outcome = outcome(
        RangePublishers::flawed(PublisherFlaw::EmitsWithoutDemand),
        "subscription_request_must_result_in_the_correct_number_of_produced_elements",
    );
    let RuleOutcome::Failed(reason) = outcome else {
        panic!("expected a failure, got {outcome:?}");
    };
    assert!(reason.contains("before the first request"), "{reason}");
}

#[test]
fn retaining_cancelled_subscribers_is_detected() {
    let outcome = outcome(
        RangePublishers::flawed(PublisherFlaw::KeepsCancelledSubscribers),
        "cancel_must_make_the_publisher_eventually_drop_all_references_to_the_subscriber",
    );
    let RuleOutcome::Failed(reason) = outcome else {
        panic!("expected a failure, got {outcome:?}");
    };
    assert!(reason.contains("did not drop reference"), "{reason}");
}

#[test]
fn missing_failed_publisher_skips_its_rules() {
    let factory =
        Arc::new(RangePublishers { flaw: PublisherFlaw::None, with_failed_publisher: false });
    let outcome =
        outcome(factory, "may_reject_calls_to_subscribe_with_on_error_after_on_subscribe");

    let RuleOutcome::Skipped(reason) = outcome else {
        panic!("expected a skip, got {outcome:?}");
    };
    assert!(reason.contains("no failed publisher"), "{reason}");
}

#[test]
fn unknown_rule_is_none() {
    assert!(suite(RangePublishers::correct()).run_rule("no_such_rule").is_none());
}

#[test]
fn default_capabilities_run_multi_subscriber_rules() {
    let suite = PublisherVerification::new(support::env(), Arc::new(DefaultRangePublishers));
    for name in [
        "may_support_multi_subscribe",
        "registered_subscribers_must_receive_on_next_or_on_complete_signals",
        "multicast_same_elements_in_same_sequence_when_requesting_one_by_one",
        "multicast_same_elements_when_requesting_many_upfront_and_complete_as_expected",
    ] {
        let report = suite.run_rule(name).expect("rule exists");
        assert_eq!(report.rule, "1.11", "{name}");
        assert_eq!(report.outcome, RuleOutcome::Passed, "{name}");
    }
}

#[test]
fn unbounded_recursion_is_detected() {
    let report = suite(RangePublishers::flawed(PublisherFlaw::RecursesWithoutGuard))
        .run_rule("must_not_allow_unbounded_recursion_between_request_and_on_next")
        .expect("rule exists");

    assert_eq!(report.rule, "3.3");
    let reason = failure_reason(report.outcome);
    assert!(reason.contains("got 2 on_next calls within thread"), "{reason}");
}

#[test]
fn erroring_on_demand_overflow_is_detected() {
    let factory = RangePublishers::flawed(PublisherFlaw::OverflowsDemand);
    let report = suite(Arc::clone(&factory))
        .run_rule("must_not_signal_on_error_when_pending_above_max_demand")
        .expect("rule exists");

    assert_eq!(report.rule, "3.17");
    let reason = failure_reason(report.outcome);
    assert!(reason.contains("while demand overflowed"), "{reason}");

    // Demand that stays within MAX_DEMAND is still honoured.
    let outcome =
        outcome(factory, "must_support_a_cumulative_pending_element_count_up_to_max_demand");
    assert_eq!(outcome, RuleOutcome::Passed);
}

#[test]
fn concurrent_signalling_is_detected() {
    let report = suite(RangePublishers::flawed(PublisherFlaw::SignalsConcurrently))
        .run_rule("must_signal_on_methods_sequentially")
        .expect("rule exists");

    assert_eq!(report.rule, "1.3");
    let reason = failure_reason(report.outcome);
    assert!(reason.starts_with("iteration 1 of "), "{reason}");
    assert!(reason.contains("illegal concurrent access detected"), "{reason}");
}
