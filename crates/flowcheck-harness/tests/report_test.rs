//! Suite report rendering
//!
//! Verifies:
//! - Reports serialize with tagged outcomes and snake_case levels
//! - The text rendering lists every rule and ends with a summary line
//! - Merged reports keep their sub-suite prefix through serialization

use flowcheck_harness::{RuleLevel, RuleOutcome, RuleReport, SuiteReport};
use serde_json::json;

fn report(name: &str, rule: &'static str, level: RuleLevel, outcome: RuleOutcome) -> RuleReport {
    RuleReport { name: name.to_string(), rule, level, description: "checks something", outcome }
}

fn sample() -> SuiteReport {
    let mut suite = SuiteReport::new("publisher");
    suite.rules = vec![
        report("produces_requested_elements", "1.1", RuleLevel::Required, RuleOutcome::Passed),
        report(
            "request_zero_signals_error",
            "3.9",
            RuleLevel::Required,
            RuleOutcome::Failed("did not receive expected on_error".to_string()),
        ),
        report(
            "rejects_null_subscriber",
            "1.9",
            RuleLevel::Untested,
            RuleOutcome::Skipped("not expressible".to_string()),
        ),
    ];
    suite
}

#[test]
fn serializes_tagged_outcomes() {
    let value = serde_json::to_value(sample()).expect("serializable");

    assert_eq!(value["suite"], "publisher");
    assert_eq!(value["rules"][0]["level"], "required");
    assert_eq!(value["rules"][0]["outcome"], json!({ "status": "passed" }));
    assert_eq!(
        value["rules"][1]["outcome"],
        json!({ "status": "failed", "detail": "did not receive expected on_error" })
    );
    assert_eq!(value["rules"][2]["level"], "untested");
    assert_eq!(value["rules"][2]["outcome"]["status"], "skipped");
}

#[test]
fn display_lists_rules_and_summary() {
    let text = sample().to_string();
    let lines: Vec<_> = text.lines().collect();

    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("[PASS] 1.1"));
    assert!(lines[0].ends_with("produces_requested_elements"));
    assert!(lines[1].starts_with("[FAIL] 3.9"));
    assert!(lines[1].ends_with(": did not receive expected on_error"));
    assert!(lines[2].starts_with("[SKIP] 1.9"));
    assert_eq!(lines[3], "publisher: 1 passed, 1 failed, 1 skipped");
}

#[test]
fn merged_names_survive_serialization() {
    let mut processor = SuiteReport::new("identity_processor");
    processor.merge("publisher", sample());

    assert!(!processor.is_conformant());
    let value = serde_json::to_value(&processor).expect("serializable");
    assert_eq!(value["rules"][1]["name"], "publisher::request_zero_signals_error");
    assert_eq!(processor.failures().count(), 1);
}
