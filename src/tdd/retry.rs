//! Retry policy, hint generation, stagnation detection, and progression
//! tracking for the RED phase's test-fix loop. Ported from a retry strategy
//! that originally worked over Python tracebacks; the categorization and
//! bucketing rules are kept, the representation is not.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    Syntax,
    TestFailure,
    Import,
    Runtime,
    Validation,
    Unknown,
}

/// One observed failure feeding the retry decision and hint generation.
#[derive(Debug, Clone, Default)]
pub struct FailureDetail {
    pub test_name: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub missing_module: Option<String>,
    pub missing_attribute: Option<String>,
    pub missing_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Failure {
    pub category: FailureCategory,
    pub message: String,
    pub details: Vec<FailureDetail>,
}

fn non_retryable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)permission denied|disk full|timeout|memory|recursion").unwrap()
    })
}

/// `attempt` is 1-based: the attempt about to be made, not the one just
/// completed. `max_retries` is the ceiling on total attempts for this
/// failure's category-independent caller (the TDD engine passes
/// `max_phase_retries`, already folded with any stagnation cap).
pub fn should_retry(failure: &Failure, attempt: u32, max_retries: u32) -> bool {
    if attempt >= max_retries {
        return false;
    }
    if failure.category == FailureCategory::Import {
        return false;
    }
    if non_retryable_pattern().is_match(&failure.message) {
        return false;
    }
    true
}

/// Per-category (max_attempts, backoff_seconds), matching the constants
/// table. Import is included for completeness even though `should_retry`
/// never lets it retry.
pub fn category_policy(category: FailureCategory) -> (u32, u64) {
    match category {
        FailureCategory::Syntax => crate::constants::RETRY_SYNTAX,
        FailureCategory::TestFailure => crate::constants::RETRY_TEST_FAILURE,
        FailureCategory::Import => crate::constants::RETRY_IMPORT,
        _ => crate::constants::RETRY_TEST_FAILURE,
    }
}

/// Last-three-failures-share-5-tokens stagnation check, over whitespace
/// tokens of the failure messages.
pub fn is_stagnant(recent_failures: &[Failure]) -> bool {
    if recent_failures.len() < 3 {
        return false;
    }
    let last_three = &recent_failures[recent_failures.len() - 3..];
    let token_sets: Vec<HashSet<&str>> = last_three
        .iter()
        .map(|f| f.message.split_whitespace().collect())
        .collect();

    let mut shared: HashSet<&str> = token_sets[0].clone();
    for set in &token_sets[1..] {
        shared = shared.intersection(set).cloned().collect();
    }
    shared.len() >= 5
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HintBuckets {
    pub import: Vec<String>,
    pub assertion: Vec<String>,
    pub attribute: Vec<String>,
    pub name: Vec<String>,
}

/// Builds actionable hints from failures, bucketed import/assertion/
/// attribute/name (in that order) and truncated to 5 total while
/// preserving bucket order.
pub fn generate_hints(failures: &[Failure]) -> Vec<String> {
    let mut buckets = HintBuckets::default();

    let missing_modules: Vec<String> = failures
        .iter()
        .filter(|f| f.category == FailureCategory::Import)
        .flat_map(|f| f.details.iter())
        .filter_map(|d| d.missing_module.clone())
        .collect();
    if !missing_modules.is_empty() {
        let joined = dedup_join(&missing_modules);
        buckets
            .import
            .push(format!("Create missing modules/files: {joined}"));
    }

    let assertions: Vec<&FailureDetail> = failures
        .iter()
        .filter(|f| f.category == FailureCategory::TestFailure)
        .flat_map(|f| f.details.iter())
        .filter(|d| d.test_name.is_some())
        .take(2)
        .collect();
    for d in assertions {
        let test = d.test_name.as_deref().unwrap_or("test");
        match (&d.expected, &d.actual) {
            (Some(expected), Some(actual)) => buckets.assertion.push(format!(
                "Fix {test}: expected '{expected}' but got '{actual}'"
            )),
            _ => buckets
                .assertion
                .push(format!("Fix {test}: review the failing assertion")),
        }
    }

    let attributes: Vec<&str> = failures
        .iter()
        .flat_map(|f| f.details.iter())
        .filter_map(|d| d.missing_attribute.as_deref())
        .take(2)
        .collect();
    for attr in attributes {
        match attr.rsplit_once('.') {
            Some((owner, name)) => buckets
                .attribute
                .push(format!("Add method/attribute '{name}' to {owner}")),
            None => buckets
                .attribute
                .push(format!("Define missing attribute: {attr}")),
        }
    }

    let names: Vec<String> = failures
        .iter()
        .flat_map(|f| f.details.iter())
        .filter_map(|d| d.missing_name.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .take(3)
        .collect();
    if !names.is_empty() {
        buckets
            .name
            .push(format!("Define missing names: {}", names.join(", ")));
    }

    let mut hints = Vec::with_capacity(5);
    hints.extend(buckets.import);
    hints.extend(buckets.assertion);
    hints.extend(buckets.attribute);
    hints.extend(buckets.name);
    hints.truncate(5);
    hints
}

fn dedup_join(items: &[String]) -> String {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|m| seen.insert(m.as_str()))
        .cloned()
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressionEntry {
    pub attempt: u32,
    pub failing_count: usize,
    pub newly_passed_count: usize,
    pub persistent_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Progression {
    pub newly_passed: HashSet<String>,
    pub persistent: HashSet<String>,
    pub entry: ProgressionEntry,
}

pub fn track_progression(
    attempt: u32,
    previous_failing: &HashSet<String>,
    current_failing: &HashSet<String>,
) -> Progression {
    let newly_passed: HashSet<String> = previous_failing
        .difference(current_failing)
        .cloned()
        .collect();
    let persistent: HashSet<String> = previous_failing
        .intersection(current_failing)
        .cloned()
        .collect();

    Progression {
        entry: ProgressionEntry {
            attempt,
            failing_count: current_failing.len(),
            newly_passed_count: newly_passed.len(),
            persistent_count: persistent.len(),
        },
        newly_passed,
        persistent,
    }
}

/// First / final / nth-of-max retry messaging for log lines and
/// `RetryDecision` payloads.
pub fn backoff_message(attempt: u32, max_retries: u32) -> String {
    if attempt <= 1 {
        "first retry attempt".to_string()
    } else if attempt >= max_retries {
        format!("final retry attempt ({attempt} of {max_retries})")
    } else {
        format!("retry attempt {attempt} of {max_retries}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(category: FailureCategory, message: &str) -> Failure {
        Failure {
            category,
            message: message.to_string(),
            details: vec![],
        }
    }

    #[test]
    fn import_errors_never_retry() {
        let f = failure(FailureCategory::Import, "ModuleNotFoundError: no module named foo");
        assert!(!should_retry(&f, 1, 5));
    }

    #[test]
    fn non_retryable_patterns_block_retry() {
        let f = failure(FailureCategory::Runtime, "operation timeout after 30s");
        assert!(!should_retry(&f, 0, 5));
    }

    #[test]
    fn attempt_at_max_never_retries() {
        let f = failure(FailureCategory::Syntax, "unexpected token");
        assert!(!should_retry(&f, 2, 2));
    }

    #[test]
    fn syntax_failure_under_max_retries() {
        let f = failure(FailureCategory::Syntax, "unexpected token");
        assert!(should_retry(&f, 0, 2));
    }

    #[test]
    fn stagnation_detects_shared_tokens_across_last_three() {
        let failures = vec![
            failure(FailureCategory::TestFailure, "assert result equals expected value here"),
            failure(FailureCategory::TestFailure, "assert result equals expected value now"),
            failure(FailureCategory::TestFailure, "assert result equals expected value again"),
        ];
        assert!(is_stagnant(&failures));
    }

    #[test]
    fn fewer_than_three_failures_never_stagnant() {
        let failures = vec![failure(FailureCategory::TestFailure, "a b c d e")];
        assert!(!is_stagnant(&failures));
    }

    #[test]
    fn hint_generation_preserves_bucket_order_and_truncates() {
        let failures = vec![
            Failure {
                category: FailureCategory::Import,
                message: "missing module".to_string(),
                details: vec![FailureDetail {
                    missing_module: Some("widgets.core".to_string()),
                    ..Default::default()
                }],
            },
            Failure {
                category: FailureCategory::TestFailure,
                message: "assertion failed".to_string(),
                details: vec![FailureDetail {
                    test_name: Some("test_add".to_string()),
                    expected: Some("4".to_string()),
                    actual: Some("5".to_string()),
                    ..Default::default()
                }],
            },
        ];
        let hints = generate_hints(&failures);
        assert_eq!(hints[0], "Create missing modules/files: widgets.core");
        assert_eq!(hints[1], "Fix test_add: expected '4' but got '5'");
    }

    #[test]
    fn attribute_hint_splits_owner_and_name() {
        let failures = vec![Failure {
            category: FailureCategory::Runtime,
            message: "attribute error".to_string(),
            details: vec![FailureDetail {
                missing_attribute: Some("Widget.render".to_string()),
                ..Default::default()
            }],
        }];
        let hints = generate_hints(&failures);
        assert_eq!(hints[0], "Add method/attribute 'render' to Widget");
    }

    #[test]
    fn progression_tracks_newly_passed_and_persistent() {
        let previous: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let current: HashSet<String> = ["b"].iter().map(|s| s.to_string()).collect();
        let progression = track_progression(2, &previous, &current);
        assert_eq!(progression.newly_passed.len(), 2);
        assert_eq!(progression.persistent.len(), 1);
    }

    #[test]
    fn backoff_message_flags_final_attempt() {
        assert_eq!(backoff_message(1, 3), "first retry attempt");
        assert_eq!(backoff_message(3, 3), "final retry attempt (3 of 3)");
        assert_eq!(backoff_message(2, 3), "retry attempt 2 of 3");
    }
}
