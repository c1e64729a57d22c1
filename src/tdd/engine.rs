//! RED/YELLOW/GREEN/COMPLETE state machine for one feature. Every
//! transition closes the previous phase's timer, opens the next one's, and
//! appends to the transition log; callers never mutate `Feature::phase`
//! directly.

use crate::config::TddConfig;
use crate::error::{OrchestratorError, Result};
use crate::store::model::{Feature, Phase, PhaseTransition, TestAttempt};
use crate::store::Store;
use crate::tdd::retry::{self, Failure, Progression};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub struct TddEngine {
    store: Arc<Store>,
    config: TddConfig,
}

#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub attempt: u32,
    pub max_retries: u32,
    pub stagnant: bool,
    pub hints: Vec<String>,
    pub progression: Progression,
    pub message: String,
}

impl TddEngine {
    pub fn new(store: Arc<Store>, config: TddConfig) -> Self {
        Self { store, config }
    }

    pub async fn start_feature(&self, feature: Feature) -> Result<Feature> {
        self.store.put_feature(feature.clone()).await?;
        info!(feature_id = %feature.id, "feature entered RED phase");
        Ok(feature)
    }

    fn transition(feature: &mut Feature, to: Phase) {
        let now = Utc::now();
        let elapsed = (now - feature.phase_entered_at).num_milliseconds().max(0) as u64;
        *feature.phase_duration_ms.entry(feature.phase).or_insert(0) += elapsed;

        feature.transitions.push(PhaseTransition {
            from: feature.phase,
            to,
            at: now,
        });
        feature.phase = to;
        feature.phase_entered_at = now;
    }

    /// Re-enters RED, either for the first time or after a YELLOW rejection.
    /// The latter increments `fix_iterations`.
    pub async fn enter_red(&self, feature_id: &str, after_rejection: bool) -> Result<Feature> {
        self.store
            .update_feature(feature_id, |f| {
                if after_rejection {
                    f.fix_iterations += 1;
                }
                Self::transition(f, Phase::Red);
            })
            .await
    }

    pub async fn write_tests(
        &self,
        feature_id: &str,
        test_file_count: u32,
        test_function_count: u32,
    ) -> Result<Feature> {
        self.store
            .update_feature(feature_id, |f| {
                f.tests_written = true;
                f.test_file_count = test_file_count;
                f.test_function_count = test_function_count;
            })
            .await
    }

    /// Records one test run's result while the feature is in RED. The
    /// canonical RED flow observes `failed > 0` at least once; a run with
    /// `failed == 0` is what unlocks `enter_yellow`.
    pub async fn run_tests(
        &self,
        feature_id: &str,
        attempt: u32,
        passed: u32,
        failed: u32,
        currently_failing: HashSet<String>,
    ) -> Result<Feature> {
        let feature = self
            .store
            .get_feature(feature_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("feature {feature_id}")))?;
        let previous_failing = feature.failing_tests.clone();
        let progression = retry::track_progression(attempt, &previous_failing, &currently_failing);

        self.store
            .update_feature(feature_id, |f| {
                f.test_history.push(TestAttempt {
                    attempt,
                    passed,
                    failed,
                    newly_passed: progression.newly_passed.clone(),
                    persistent_failures: progression.persistent.clone(),
                    at: Utc::now(),
                });
                f.failing_tests = currently_failing;
                f.persistent_failures = progression.persistent.clone();
            })
            .await
    }

    /// Only legal when the last recorded test run has `failed == 0`.
    pub async fn enter_yellow(&self, feature_id: &str) -> Result<Feature> {
        let feature = self
            .store
            .get_feature(feature_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("feature {feature_id}")))?;
        let last_clean = feature
            .test_history
            .last()
            .map(|t| t.failed == 0)
            .unwrap_or(false);
        if feature.phase != Phase::Red || !last_clean {
            return Err(OrchestratorError::Validation(
                "cannot enter YELLOW before tests pass in RED".to_string(),
            ));
        }
        self.store
            .update_feature(feature_id, |f| Self::transition(f, Phase::Yellow))
            .await
    }

    /// Approved review moves to GREEN and clears YELLOW context; rejected
    /// review returns to RED, preserving feedback and the review-attempt
    /// counter for the next cycle.
    pub async fn review_result(
        &self,
        feature_id: &str,
        approved: bool,
        feedback: Vec<String>,
    ) -> Result<Feature> {
        let feature = self
            .store
            .get_feature(feature_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("feature {feature_id}")))?;
        if feature.phase != Phase::Yellow {
            return Err(OrchestratorError::Validation(
                "review_result is only valid from YELLOW".to_string(),
            ));
        }

        if approved {
            self.store
                .update_feature(feature_id, |f| {
                    f.review_feedback.clear();
                    Self::transition(f, Phase::Green);
                })
                .await
        } else {
            self.store
                .update_feature(feature_id, |f| {
                    f.review_attempts += 1;
                    f.review_feedback = feedback.clone();
                    f.fix_iterations += 1;
                    Self::transition(f, Phase::Red);
                })
                .await
        }
    }

    /// Terminal-for-cycle: the feature is done.
    pub async fn enter_green_complete(&self, feature_id: &str) -> Result<Feature> {
        let feature = self
            .store
            .get_feature(feature_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("feature {feature_id}")))?;
        if feature.phase != Phase::Green {
            return Err(OrchestratorError::Validation(
                "enter_green_complete is only valid from GREEN".to_string(),
            ));
        }
        self.store
            .update_feature(feature_id, |f| Self::transition(f, Phase::Complete))
            .await
    }

    /// Computes whether the RED loop should retry, combining the category
    /// policy, the non-retryable pattern, the stagnation cap, and the
    /// hint/progression context for the retry prompt.
    pub async fn evaluate_retry(
        &self,
        feature_id: &str,
        attempt: u32,
        failure: &Failure,
        recent_failures: &[Failure],
    ) -> Result<RetryDecision> {
        let feature = self
            .store
            .get_feature(feature_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("feature {feature_id}")))?;

        let stagnant = retry::is_stagnant(recent_failures);
        let effective_max = if stagnant {
            self.config.max_stagnation_retries
        } else {
            self.config.max_phase_retries
        };

        let permitted = retry::should_retry(failure, attempt, effective_max);
        if stagnant && permitted {
            warn!(feature_id, attempt, "retry loop stagnating on repeated failure tokens");
        }

        let hints = retry::generate_hints(recent_failures);
        let current_failing: HashSet<String> = feature.failing_tests.clone();
        let previous_failing: HashSet<String> = feature
            .test_history
            .iter()
            .rev()
            .nth(1)
            .map(|t| t.persistent_failures.union(&t.newly_passed).cloned().collect())
            .unwrap_or_default();
        let progression = retry::track_progression(attempt, &previous_failing, &current_failing);

        Ok(RetryDecision {
            should_retry: permitted,
            attempt,
            max_retries: effective_max,
            stagnant,
            hints,
            progression,
            message: retry::backoff_message(attempt, effective_max),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tdd::retry::FailureCategory;
    use std::time::Duration;

    fn config() -> TddConfig {
        TddConfig {
            max_phase_retries: 3,
            max_total_retries: 10,
            max_stagnation_retries: 2,
            phase_timeout_red: Duration::from_secs(60),
            phase_timeout_yellow: Duration::from_secs(120),
            phase_timeout_green: Duration::from_secs(30),
        }
    }

    fn feature() -> Feature {
        Feature::new(
            "f1".to_string(),
            "j1".to_string(),
            "t1".to_string(),
            "Widget rendering".to_string(),
            "renders a widget".to_string(),
        )
    }

    #[tokio::test]
    async fn cannot_enter_yellow_while_tests_failing() {
        let store = Arc::new(Store::new());
        let engine = TddEngine::new(Arc::clone(&store), config());
        engine.start_feature(feature()).await.unwrap();
        engine
            .run_tests("f1", 1, 0, 3, ["t_a".to_string()].into_iter().collect())
            .await
            .unwrap();
        assert!(engine.enter_yellow("f1").await.is_err());
    }

    #[tokio::test]
    async fn enters_yellow_once_tests_pass() {
        let store = Arc::new(Store::new());
        let engine = TddEngine::new(Arc::clone(&store), config());
        engine.start_feature(feature()).await.unwrap();
        engine.run_tests("f1", 1, 3, 0, HashSet::new()).await.unwrap();
        let f = engine.enter_yellow("f1").await.unwrap();
        assert_eq!(f.phase, Phase::Yellow);
    }

    #[tokio::test]
    async fn rejected_review_returns_to_red_and_increments_iterations() {
        let store = Arc::new(Store::new());
        let engine = TddEngine::new(Arc::clone(&store), config());
        engine.start_feature(feature()).await.unwrap();
        engine.run_tests("f1", 1, 3, 0, HashSet::new()).await.unwrap();
        engine.enter_yellow("f1").await.unwrap();
        let f = engine
            .review_result("f1", false, vec!["needs cleanup".to_string()])
            .await
            .unwrap();
        assert_eq!(f.phase, Phase::Red);
        assert_eq!(f.fix_iterations, 1);
        assert_eq!(f.review_feedback, vec!["needs cleanup".to_string()]);
    }

    #[tokio::test]
    async fn approved_review_reaches_complete() {
        let store = Arc::new(Store::new());
        let engine = TddEngine::new(Arc::clone(&store), config());
        engine.start_feature(feature()).await.unwrap();
        engine.run_tests("f1", 1, 3, 0, HashSet::new()).await.unwrap();
        engine.enter_yellow("f1").await.unwrap();
        engine.review_result("f1", true, vec![]).await.unwrap();
        let f = engine.enter_green_complete("f1").await.unwrap();
        assert_eq!(f.phase, Phase::Complete);
    }

    #[tokio::test]
    async fn evaluate_retry_respects_category_and_attempt_ceiling() {
        let store = Arc::new(Store::new());
        let engine = TddEngine::new(Arc::clone(&store), config());
        engine.start_feature(feature()).await.unwrap();
        let failure = Failure {
            category: FailureCategory::TestFailure,
            message: "assertion failed".to_string(),
            details: vec![],
        };
        let decision = engine
            .evaluate_retry("f1", 1, &failure, std::slice::from_ref(&failure))
            .await
            .unwrap();
        assert!(decision.should_retry);
    }
}
