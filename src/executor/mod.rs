//! Job submission, DAG translation, readiness-driven dispatch, and result
//! recording. The one component that ties the state store, the
//! coordination plane, and the TDD engine together.
//!
//! Dispatch is queue-driven rather than recursive: completing a task can
//! make its dependents ready, so `dispatch_one` returns the ids that just
//! became dispatchable and the caller feeds them back into its own work
//! queue, the same shape as the teacher's `process_tasks` poll loop.

pub mod plan;
pub mod tdd_flow;

use crate::agent::{Agent, AgentContext};
use crate::config::TddConfig;
use crate::coordination::circuit_breaker;
use crate::coordination::{HealthMonitor, RouteRequest, Router};
use crate::error::{OrchestratorError, Result};
use crate::store::event_log;
use crate::store::model::{Feature, Job, JobStatus, Priority, Task, TaskStatus};
use crate::store::Store;
use crate::tdd::TddEngine;
use plan::{translate_plan, PlanStep};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

const PLANNER_AGENT_TYPE: &str = "planner";

pub struct Executor {
    store: Arc<Store>,
    router: Arc<Router>,
    health: Arc<HealthMonitor>,
    tdd: Arc<TddEngine>,
    tdd_config: TddConfig,
    known_agent_types: HashSet<String>,
    handles: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl Executor {
    pub fn new(
        store: Arc<Store>,
        router: Arc<Router>,
        health: Arc<HealthMonitor>,
        tdd: Arc<TddEngine>,
        tdd_config: TddConfig,
    ) -> Self {
        Self {
            store,
            router,
            health,
            tdd,
            tdd_config,
            known_agent_types: HashSet::new(),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an in-process worker under `agent_id`, making its
    /// `agent_type` eligible for planning and reachable once the router
    /// selects that id.
    pub async fn register_agent(&mut self, agent_id: impl Into<String>, agent: Arc<dyn Agent>) {
        self.known_agent_types.insert(agent.agent_type().to_string());
        self.handles.write().await.insert(agent_id.into(), agent);
    }

    fn mint_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub async fn create_job(
        &self,
        user_request: String,
        priority: Priority,
        tags: Vec<String>,
    ) -> Result<Job> {
        let job_id = Self::mint_id();
        let job = Job::new(job_id.clone(), user_request.clone(), priority, tags);
        self.store.put_job(job.clone()).await?;

        let planner_task = Task::new(
            Self::mint_id(),
            job_id.clone(),
            PLANNER_AGENT_TYPE.to_string(),
            user_request,
            HashSet::new(),
        );
        self.store.put_task(planner_task.clone()).await?;
        if let Some(mut persisted) = self.store.get_job(&job_id).await {
            persisted.task_ids.push(planner_task.id.clone());
            self.store.put_job(persisted).await?;
        }

        self.emit_job_event(&job_id, "job_status", json!({"status": "PLANNING"})).await;
        self.drain_frontier(vec![planner_task.id]).await;
        Ok(job)
    }

    /// Runs dispatch to completion for every task that becomes ready,
    /// transitively. Each iteration dispatches one task and feeds whatever
    /// it unblocks back into the queue; never recurses.
    async fn drain_frontier(&self, mut frontier: Vec<String>) {
        while let Some(task_id) = frontier.pop() {
            let ready = self.dispatch_one(&task_id).await;
            frontier.extend(ready);
        }
    }

    /// Enqueue = PENDING -> QUEUED + route + append to the agent's input
    /// stream, then (for in-process agents) invoke and record the result.
    /// Returns the ids of any tasks this unblocked. A no-op (returns
    /// nothing) if the task isn't PENDING.
    async fn dispatch_one(&self, task_id: &str) -> Vec<String> {
        let Some(task) = self.store.get_task(task_id).await else {
            warn!(task_id, "dispatch requested for unknown task");
            return Vec::new();
        };
        if task.status != TaskStatus::Pending {
            return Vec::new();
        }
        if let Err(e) = self.store.set_task_status(task_id, TaskStatus::Queued).await {
            error!(task_id, error = %e, "failed to mark task queued");
            return Vec::new();
        }

        let job = self.store.get_job(&task.job_id).await;
        let mut req = RouteRequest::new(task_id, task.agent_type.as_str());
        req.priority = job.map(|j| j.priority).unwrap_or(Priority::Normal);

        let route_result = self.router.route_with_retry(&req).await;
        let Some(agent_id) = route_result.agent_id.clone() else {
            let reason = route_result.reason.unwrap_or_else(|| "routing_failed".to_string());
            self.fail_task(task_id, &task.job_id, "routing_failed", &reason).await;
            return Vec::new();
        };

        self.store
            .set_task_result(task_id, None, None, Some(agent_id.clone()))
            .await
            .ok();
        self.store
            .events
            .append(
                &crate::coordination::stream_naming::agent_input_stream(&task.agent_type),
                json!({
                    "task_id": task_id,
                    "job_id": task.job_id,
                    "agent_type": task.agent_type,
                    "description": task.description,
                    "use_tdd": task.use_tdd,
                    "assigned_agent_id": agent_id,
                }),
            )
            .await;
        self.store.set_task_status(task_id, TaskStatus::Running).await.ok();
        self.health.record_task_start(&agent_id, task_id).await;

        self.invoke_and_record(&task, &agent_id).await
    }

    async fn invoke_and_record(&self, task: &Task, agent_id: &str) -> Vec<String> {
        let Some(agent) = self.handles.read().await.get(agent_id).cloned() else {
            warn!(task_id = %task.id, agent_id, "no in-process handle for routed agent; leaving task running");
            return Vec::new();
        };

        let context = AgentContext {
            task_id: task.id.clone(),
            job_id: task.job_id.clone(),
            agent_type: task.agent_type.clone(),
            description: task.description.clone(),
            priority: 0,
            required_capabilities: vec![],
            preferred_tags: vec![],
            timeout_seconds: 120,
            metadata: HashMap::new(),
        };

        let outcome = if task.agent_type == PLANNER_AGENT_TYPE {
            Self::invoke_with_deadline(&agent, context).await
        } else if task.use_tdd {
            self.run_tdd_task(task, &agent, context).await
        } else {
            Self::invoke_with_deadline(&agent, context).await
        };

        match outcome {
            Ok(value) => {
                self.health.record_task_completion(agent_id, &task.id, true).await;
                circuit_breaker::record_success(&self.store, agent_id).await;
                if task.agent_type == PLANNER_AGENT_TYPE {
                    self.complete_plan(&task.job_id, &task.id, value).await
                } else {
                    self.complete_task(&task.id, &task.job_id, value).await
                }
            }
            Err(e) => {
                self.health.record_task_completion(agent_id, &task.id, false).await;
                circuit_breaker::record_failure(
                    &self.store,
                    agent_id,
                    self.router.circuit_breaker_threshold(),
                    self.router.circuit_breaker_timeout(),
                )
                .await;
                // The agent-supplied error_type is arbitrary and never surfaced as the
                // task's top-level category; timeouts keep their own category, everything
                // else collapses to the fixed "agent_error" with the original nested.
                let category = if e.error_type == "timeout" { "timeout" } else { "agent_error" };
                self.fail_task_with_detail(
                    &task.id,
                    &task.job_id,
                    category,
                    &e.message,
                    Some(json!({"error_type": e.error_type, "message": e.message})),
                )
                .await;
                Vec::new()
            }
        }
    }

    /// Bounds an agent invocation by its per-task deadline, failing with
    /// category `timeout` instead of hanging the dispatch loop indefinitely.
    async fn invoke_with_deadline(
        agent: &Arc<dyn Agent>,
        context: AgentContext,
    ) -> std::result::Result<Value, crate::agent::AgentError> {
        let deadline = crate::agent::task_deadline(&context);
        match tokio::time::timeout(deadline, agent.invoke(context)).await {
            Ok(result) => result.map(|o| o.structured.unwrap_or_default()),
            Err(_) => Err(crate::agent::AgentError {
                error_type: "timeout".to_string(),
                message: format!("agent invocation exceeded {}s", deadline.as_secs()),
            }),
        }
    }

    async fn run_tdd_task(
        &self,
        task: &Task,
        agent: &Arc<dyn Agent>,
        context: AgentContext,
    ) -> std::result::Result<Value, crate::agent::AgentError> {
        let feature_id = Self::mint_id();
        let feature = Feature::new(
            feature_id.clone(),
            task.job_id.clone(),
            task.id.clone(),
            task.description.clone(),
            task.description.clone(),
        );
        self.tdd.start_feature(feature).await.map_err(|e| crate::agent::AgentError {
            error_type: "store_unavailable".to_string(),
            message: e.to_string(),
        })?;
        self.store.set_task_result(&task.id, None, None, None).await.ok();

        tdd_flow::run_tdd_cycle(&self.tdd, agent, &feature_id, &context, self.tdd_config.max_total_retries)
            .await
            .map_err(|(error_type, message)| crate::agent::AgentError { error_type, message })
    }

    async fn complete_plan(&self, job_id: &str, planner_task_id: &str, plan_value: Value) -> Vec<String> {
        self.store
            .set_task_result(planner_task_id, Some(plan_value.clone()), None, None)
            .await
            .ok();
        self.store.set_task_status(planner_task_id, TaskStatus::Completed).await.ok();

        let steps: Vec<PlanStep> = match plan_value.get("tasks").or(Some(&plan_value)) {
            Some(v) => match serde_json::from_value(v.clone()) {
                Ok(steps) => steps,
                Err(e) => {
                    self.fail_job(job_id, "plan_cycle", &format!("malformed plan output: {e}")).await;
                    return Vec::new();
                }
            },
            None => Vec::new(),
        };

        let tasks = match translate_plan(job_id, &steps, &self.known_agent_types, Self::mint_id) {
            Ok(tasks) => tasks,
            Err(OrchestratorError::PlanCycle(reason)) => {
                self.fail_job(job_id, "plan_cycle", &reason).await;
                return Vec::new();
            }
            Err(OrchestratorError::PlanUnknownAgent(reason)) => {
                self.fail_job(job_id, "plan_unknown_agent", &reason).await;
                return Vec::new();
            }
            Err(e) => {
                self.fail_job(job_id, "plan_cycle", &e.to_string()).await;
                return Vec::new();
            }
        };

        let mut new_ids = Vec::with_capacity(tasks.len());
        let mut ready = Vec::new();
        for task in &tasks {
            new_ids.push(task.id.clone());
            if let Err(e) = self.store.put_task(task.clone()).await {
                self.fail_job(job_id, "store_unavailable", &e.to_string()).await;
                return Vec::new();
            }
            if task.dependencies.is_empty() {
                ready.push(task.id.clone());
            }
        }

        if let Some(mut job) = self.store.get_job(job_id).await {
            job.task_ids.extend(new_ids);
            self.store.put_job(job).await.ok();
        }

        if let Err(e) = self.store.set_job_status(job_id, JobStatus::Running, None).await {
            error!(job_id, error = %e, "failed to mark job running after plan translation");
            return Vec::new();
        }
        self.emit_job_event(job_id, "job_status_changed", json!({"status": "RUNNING"})).await;
        self.check_job_completion(job_id).await;
        ready
    }

    async fn complete_task(&self, task_id: &str, job_id: &str, result: Value) -> Vec<String> {
        self.store
            .set_task_result(task_id, Some(result.clone()), None, None)
            .await
            .ok();
        self.store.set_task_status(task_id, TaskStatus::Completed).await.ok();
        self.emit_job_event(job_id, "task_completed", json!({"task_id": task_id, "result": result}))
            .await;

        let ready = self.ready_dependents(job_id, task_id).await;
        self.check_job_completion(job_id).await;
        ready
    }

    async fn fail_task(&self, task_id: &str, job_id: &str, category: &str, message: &str) {
        self.fail_task_with_detail(task_id, job_id, category, message, None).await;
    }

    async fn fail_task_with_detail(
        &self,
        task_id: &str,
        job_id: &str,
        category: &str,
        message: &str,
        detail: Option<Value>,
    ) {
        let mut result = json!({"category": category, "message": message});
        if let (Value::Object(map), Some(detail)) = (&mut result, detail) {
            map.insert("detail".to_string(), detail);
        }
        self.store.set_task_result(task_id, None, Some(result), None).await.ok();
        self.store.set_task_status(task_id, TaskStatus::Failed).await.ok();
        self.emit_job_event(
            job_id,
            "task_failed",
            json!({"task_id": task_id, "category": category, "message": message}),
        )
        .await;
        self.check_job_completion(job_id).await;
    }

    async fn ready_dependents(&self, job_id: &str, completed_task_id: &str) -> Vec<String> {
        let tasks = self.store.tasks_for_job(job_id).await;
        let completed: HashSet<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();

        tasks
            .into_iter()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.dependencies.contains(completed_task_id)
                    && t.dependencies.is_subset(&completed)
            })
            .map(|t| t.id)
            .collect()
    }

    /// Any FAILED task fails the job; otherwise all-COMPLETED completes it.
    async fn check_job_completion(&self, job_id: &str) {
        let Some(job) = self.store.get_job(job_id).await else { return };
        if job.status.is_terminal() {
            return;
        }
        let tasks = self.store.tasks_for_job(job_id).await;
        if tasks.is_empty() {
            return;
        }

        if let Some(failed) = tasks.iter().find(|t| t.status == TaskStatus::Failed) {
            if failed.agent_type == PLANNER_AGENT_TYPE {
                self.fail_job(job_id, "plan_failed", &format!("planning task {} failed", failed.id))
                    .await;
            } else {
                self.fail_job(job_id, "task_failed", &format!("task {} failed", failed.id)).await;
            }
            return;
        }
        if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            if let Err(e) = self.store.set_job_status(job_id, JobStatus::Completed, None).await {
                error!(job_id, error = %e, "failed to mark job completed");
                return;
            }
            self.emit_job_event(job_id, "job_status_changed", json!({"status": "COMPLETED"})).await;
            info!(job_id, "job completed");
        }
    }

    async fn fail_job(&self, job_id: &str, category: &str, reason: &str) {
        if self
            .store
            .set_job_status(job_id, JobStatus::Failed, Some(format!("{category}: {reason}")))
            .await
            .is_ok()
        {
            self.emit_job_event(
                job_id,
                "job_status_changed",
                json!({"status": "FAILED", "category": category, "reason": reason}),
            )
            .await;
            warn!(job_id, category, reason, "job failed");
        }
    }

    async fn emit_job_event(&self, job_id: &str, event_type: &str, mut fields: Value) {
        if let Value::Object(ref mut map) = fields {
            map.insert("event_type".to_string(), json!(event_type));
            map.insert("job_id".to_string(), json!(job_id));
            map.insert("timestamp".to_string(), json!(chrono::Utc::now()));
        }
        self.store.events.append(&event_log::job_stream(job_id), fields.clone()).await;
        // Global subscribers get the same payload, not a stub, so a global
        // subscription can render events without a second per-job fetch.
        self.store.events.append(event_log::GLOBAL_JOB_EVENTS, fields).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedAgent;
    use crate::config::CoordinationConfig;
    use chrono::Utc;
    use std::time::Duration;

    fn coordination_config() -> CoordinationConfig {
        CoordinationConfig {
            heartbeat_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            offline_threshold: Duration::from_secs(120),
            discovery_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
            agent_timeout: Duration::from_secs(180),
            default_routing_strategy: "health_aware".to_string(),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
        }
    }

    fn tdd_config() -> TddConfig {
        TddConfig {
            max_phase_retries: 3,
            max_total_retries: 5,
            max_stagnation_retries: 2,
            phase_timeout_red: Duration::from_secs(60),
            phase_timeout_yellow: Duration::from_secs(120),
            phase_timeout_green: Duration::from_secs(30),
        }
    }

    async fn register_active(store: &Store, id: &str, agent_type: &str) {
        let now = Utc::now();
        store
            .register_agent(crate::store::model::AgentRegistration {
                id: id.to_string(),
                agent_type: agent_type.to_string(),
                capabilities: Default::default(),
                version: "1.0".to_string(),
                max_concurrent_tasks: 4,
                priority: 10,
                tags: vec![],
                host: None,
                port: None,
                endpoint: None,
                status: crate::store::model::RegistrationStatus::Active,
                registered_at: now,
                last_seen: now,
            })
            .await
            .unwrap();
        store
            .update_agent_metrics(id, |m| m.status = crate::store::model::AgentHealthStatus::Healthy)
            .await
            .unwrap();
    }

    fn build_executor(store: Arc<Store>) -> Executor {
        let router = Arc::new(Router::new(Arc::clone(&store), &coordination_config()));
        let health = Arc::new(HealthMonitor::new(Arc::clone(&store), coordination_config()));
        let tdd = Arc::new(TddEngine::new(Arc::clone(&store), tdd_config()));
        Executor::new(store, router, health, tdd, tdd_config())
    }

    #[tokio::test]
    async fn job_with_no_dependencies_runs_to_completion() {
        let store = Arc::new(Store::new());
        register_active(&store, "planner-1", "planner").await;
        register_active(&store, "coding-1", "coding").await;

        let mut executor = build_executor(Arc::clone(&store));

        let planner = ScriptedAgent::new(
            "planner",
            vec![],
            vec![ScriptedAgent::success_structured(
                "plan",
                serde_json::json!([{"agent_type": "coding", "description": "write it", "dependencies": []}]),
            )],
        );
        executor.register_agent("planner-1", Arc::new(planner)).await;

        let coder = ScriptedAgent::new(
            "coding",
            vec![],
            vec![ScriptedAgent::success_structured("done", serde_json::json!({"ok": true}))],
        );
        executor.register_agent("coding-1", Arc::new(coder)).await;

        let job = executor
            .create_job("build a thing".to_string(), Priority::Normal, vec![])
            .await
            .unwrap();

        let final_job = store.get_job(&job.id).await.unwrap();
        assert_eq!(final_job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_agent_type_fails_job_with_plan_unknown_agent() {
        let store = Arc::new(Store::new());
        register_active(&store, "planner-1", "planner").await;

        let mut executor = build_executor(Arc::clone(&store));

        let planner = ScriptedAgent::new(
            "planner",
            vec![],
            vec![ScriptedAgent::success_structured(
                "plan",
                serde_json::json!([{"agent_type": "mystery", "description": "do something", "dependencies": []}]),
            )],
        );
        executor.register_agent("planner-1", Arc::new(planner)).await;

        let job = executor
            .create_job("build a thing".to_string(), Priority::Normal, vec![])
            .await
            .unwrap();

        let final_job = store.get_job(&job.id).await.unwrap();
        assert_eq!(final_job.status, JobStatus::Failed);
        assert!(final_job.failure_reason.unwrap().contains("plan_unknown_agent"));
    }

    #[tokio::test]
    async fn chained_dependencies_dispatch_in_order() {
        let store = Arc::new(Store::new());
        register_active(&store, "planner-1", "planner").await;
        register_active(&store, "coding-1", "coding").await;

        let mut executor = build_executor(Arc::clone(&store));

        let planner = ScriptedAgent::new(
            "planner",
            vec![],
            vec![ScriptedAgent::success_structured(
                "plan",
                serde_json::json!([
                    {"agent_type": "coding", "description": "step one", "dependencies": []},
                    {"agent_type": "coding", "description": "step two", "dependencies": [0]}
                ]),
            )],
        );
        executor.register_agent("planner-1", Arc::new(planner)).await;

        let coder = ScriptedAgent::new(
            "coding",
            vec![],
            vec![
                ScriptedAgent::success_structured("first", serde_json::json!({"ok": true})),
                ScriptedAgent::success_structured("second", serde_json::json!({"ok": true})),
            ],
        );
        executor.register_agent("coding-1", Arc::new(coder)).await;

        let job = executor
            .create_job("build a chain".to_string(), Priority::Normal, vec![])
            .await
            .unwrap();

        let final_job = store.get_job(&job.id).await.unwrap();
        assert_eq!(final_job.status, JobStatus::Completed);
        let tasks = store.tasks_for_job(&job.id).await;
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    }
}
