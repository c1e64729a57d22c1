//! Drives one `coding`+`use_tdd` task through the TDD engine by repeatedly
//! invoking the assigned agent for each RED-phase attempt and the YELLOW
//! review step, translating its structured JSON replies into engine calls.

use crate::agent::{Agent, AgentContext};
use crate::tdd::retry::{self, Failure, FailureCategory};
use crate::tdd::TddEngine;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub type TddFailure = (String, String);

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(|f| f.as_str()).map(|s| s.to_string())
}

fn u32_field(v: &Value, key: &str) -> u32 {
    v.get(key).and_then(|f| f.as_u64()).unwrap_or(0) as u32
}

fn bool_field(v: &Value, key: &str, default: bool) -> bool {
    v.get(key).and_then(|f| f.as_bool()).unwrap_or(default)
}

fn string_set_field(v: &Value, key: &str) -> HashSet<String> {
    v.get(key)
        .and_then(|f| f.as_array())
        .map(|arr| arr.iter().filter_map(|e| e.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

fn string_list_field(v: &Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(|f| f.as_array())
        .map(|arr| arr.iter().filter_map(|e| e.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

fn parse_category(v: &Value) -> FailureCategory {
    match v.get("category").and_then(|f| f.as_str()).unwrap_or("") {
        "syntax" => FailureCategory::Syntax,
        "import" => FailureCategory::Import,
        "runtime" => FailureCategory::Runtime,
        "validation" => FailureCategory::Validation,
        "test_failure" | "assertion" => FailureCategory::TestFailure,
        _ => FailureCategory::TestFailure,
    }
}

async fn invoke(agent: &Arc<dyn Agent>, context: AgentContext) -> Result<Value, TddFailure> {
    let deadline = crate::agent::task_deadline(&context);
    match tokio::time::timeout(deadline, agent.invoke(context)).await {
        Ok(result) => result
            .map(|outcome| outcome.structured.unwrap_or_default())
            .map_err(|e| (e.error_type, e.message)),
        Err(_) => Err((
            "timeout".to_string(),
            format!("agent invocation exceeded {}s", deadline.as_secs()),
        )),
    }
}

fn with_description(base: &AgentContext, description: String) -> AgentContext {
    AgentContext {
        description,
        ..base.clone()
    }
}

pub async fn run_tdd_cycle(
    tdd: &TddEngine,
    agent: &Arc<dyn Agent>,
    feature_id: &str,
    base_context: &AgentContext,
    max_total_retries: u32,
) -> Result<Value, TddFailure> {
    let write_ctx = with_description(
        base_context,
        format!("Write failing tests for: {}", base_context.description),
    );
    let write_json = invoke(agent, write_ctx).await?;
    tdd.write_tests(
        feature_id,
        u32_field(&write_json, "test_file_count"),
        u32_field(&write_json, "test_function_count"),
    )
    .await
    .map_err(|e| ("store_unavailable".to_string(), e.to_string()))?;

    for cycle in 1..=max_total_retries {
        let mut attempt = 1u32;
        loop {
            let run_ctx = with_description(
                base_context,
                format!(
                    "Run tests (cycle {cycle}, attempt {attempt}) for: {}",
                    base_context.description
                ),
            );
            let run_json = invoke(agent, run_ctx).await?;
            let passed = u32_field(&run_json, "passed");
            let failed = u32_field(&run_json, "failed");
            let failing = string_set_field(&run_json, "failing_tests");

            tdd.run_tests(feature_id, attempt, passed, failed, failing.clone())
                .await
                .map_err(|e| ("store_unavailable".to_string(), e.to_string()))?;

            if failed == 0 {
                break;
            }

            let failure = Failure {
                category: parse_category(&run_json),
                message: str_field(&run_json, "message").unwrap_or_else(|| "tests failing".to_string()),
                details: vec![],
            };
            let decision = tdd
                .evaluate_retry(feature_id, attempt, &failure, std::slice::from_ref(&failure))
                .await
                .map_err(|e| ("store_unavailable".to_string(), e.to_string()))?;

            if !decision.should_retry {
                return Err((
                    "tdd_exhausted".to_string(),
                    format!("feature {feature_id} exhausted retries: {}", decision.message),
                ));
            }

            info!(feature_id, cycle, attempt, hints = ?decision.hints, "retrying RED phase");
            let (_, backoff_secs) = retry::category_policy(failure.category);
            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            attempt += 1;
        }

        tdd.enter_yellow(feature_id)
            .await
            .map_err(|e| ("store_unavailable".to_string(), e.to_string()))?;

        let review_ctx = with_description(
            base_context,
            format!("Review implementation for: {}", base_context.description),
        );
        let review_json = invoke(agent, review_ctx).await?;
        let approved = bool_field(&review_json, "review_approved", true);
        let feedback = string_list_field(&review_json, "feedback");

        tdd.review_result(feature_id, approved, feedback)
            .await
            .map_err(|e| ("store_unavailable".to_string(), e.to_string()))?;

        if approved {
            let feature = tdd
                .enter_green_complete(feature_id)
                .await
                .map_err(|e| ("store_unavailable".to_string(), e.to_string()))?;
            return Ok(serde_json::json!({
                "feature_id": feature.id,
                "fix_iterations": feature.fix_iterations,
                "review_attempts": feature.review_attempts,
            }));
        }
    }

    Err((
        "tdd_exhausted".to_string(),
        format!("feature {feature_id} never reached an approved review"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentError, AgentOutcome, ScriptedAgent};
    use crate::config::TddConfig;
    use crate::store::model::Feature;
    use crate::store::Store;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    fn tdd_config() -> TddConfig {
        TddConfig {
            max_phase_retries: 3,
            max_total_retries: 5,
            max_stagnation_retries: 2,
            phase_timeout_red: StdDuration::from_secs(60),
            phase_timeout_yellow: StdDuration::from_secs(120),
            phase_timeout_green: StdDuration::from_secs(30),
        }
    }

    fn context() -> AgentContext {
        AgentContext {
            task_id: "t1".to_string(),
            job_id: "j1".to_string(),
            agent_type: "coding".to_string(),
            description: "implement widget".to_string(),
            priority: 5,
            required_capabilities: vec![],
            preferred_tags: vec![],
            timeout_seconds: 30,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn happy_path_completes_on_first_cycle() {
        let store = Arc::new(Store::new());
        let tdd = TddEngine::new(Arc::clone(&store), tdd_config());
        let feature = Feature::new(
            "f1".to_string(),
            "j1".to_string(),
            "t1".to_string(),
            "Widget".to_string(),
            "widget feature".to_string(),
        );
        tdd.start_feature(feature).await.unwrap();

        let agent: Arc<dyn Agent> = Arc::new(ScriptedAgent::new(
            "coding",
            vec![],
            vec![
                ScriptedAgent::success_structured("tests written", json!({"test_file_count": 1, "test_function_count": 3})),
                ScriptedAgent::success_structured("tests pass", json!({"passed": 3, "failed": 0})),
                ScriptedAgent::success_structured("approved", json!({"review_approved": true})),
            ],
        ));

        let result = run_tdd_cycle(&tdd, &agent, "f1", &context(), 5).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn exhausts_after_max_cycles_without_approval() {
        let store = Arc::new(Store::new());
        let tdd = TddEngine::new(Arc::clone(&store), tdd_config());
        let feature = Feature::new(
            "f1".to_string(),
            "j1".to_string(),
            "t1".to_string(),
            "Widget".to_string(),
            "widget feature".to_string(),
        );
        tdd.start_feature(feature).await.unwrap();

        let mut responses = vec![ScriptedAgent::success_structured(
            "tests written",
            json!({"test_file_count": 1, "test_function_count": 1}),
        )];
        for _ in 0..2 {
            responses.push(ScriptedAgent::success_structured("tests pass", json!({"passed": 1, "failed": 0})));
            responses.push(ScriptedAgent::success_structured(
                "rejected",
                json!({"review_approved": false, "feedback": ["needs work"]}),
            ));
        }
        let agent: Arc<dyn Agent> = Arc::new(ScriptedAgent::new("coding", vec![], responses));

        let result = run_tdd_cycle(&tdd, &agent, "f1", &context(), 2).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn agent_error_during_write_tests_propagates() {
        let store = Arc::new(Store::new());
        let tdd = TddEngine::new(Arc::clone(&store), tdd_config());
        let feature = Feature::new(
            "f1".to_string(),
            "j1".to_string(),
            "t1".to_string(),
            "Widget".to_string(),
            "widget feature".to_string(),
        );
        tdd.start_feature(feature).await.unwrap();

        let agent: Arc<dyn Agent> = Arc::new(ScriptedAgent::new(
            "coding",
            vec![],
            vec![Err::<AgentOutcome, AgentError>(AgentError {
                error_type: "agent_error".to_string(),
                message: "boom".to_string(),
            })],
        ));

        let result = run_tdd_cycle(&tdd, &agent, "f1", &context(), 5).await;
        assert_eq!(result.unwrap_err().0, "agent_error");
    }
}
