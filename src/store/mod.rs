//! Keyed record store plus the append-only event log (C1). Backs every other
//! component's state; components read snapshots and submit updates through
//! the methods here rather than holding their own copies.

pub mod event_log;
pub mod model;

use crate::error::{OrchestratorError, Result};
use event_log::EventLog;
use model::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct Store {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    features: Arc<RwLock<HashMap<String, Feature>>>,
    agents: Arc<RwLock<HashMap<String, AgentRegistration>>>,
    agent_metrics: Arc<RwLock<HashMap<String, AgentMetrics>>>,
    circuit_breakers: Arc<RwLock<HashMap<String, CircuitBreakerState>>>,

    jobs_by_status: Arc<RwLock<HashMap<JobStatus, HashSet<String>>>>,
    tasks_by_status: Arc<RwLock<HashMap<TaskStatus, HashSet<String>>>>,
    tasks_by_agent_type: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    tasks_by_job: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    agents_by_status: Arc<RwLock<HashMap<RegistrationStatus, HashSet<String>>>>,
    agents_by_type: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    capability_index: Arc<RwLock<HashMap<String, HashSet<String>>>>,

    pub events: EventLog,
}

impl Store {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            features: Arc::new(RwLock::new(HashMap::new())),
            agents: Arc::new(RwLock::new(HashMap::new())),
            agent_metrics: Arc::new(RwLock::new(HashMap::new())),
            circuit_breakers: Arc::new(RwLock::new(HashMap::new())),
            jobs_by_status: Arc::new(RwLock::new(HashMap::new())),
            tasks_by_status: Arc::new(RwLock::new(HashMap::new())),
            tasks_by_agent_type: Arc::new(RwLock::new(HashMap::new())),
            tasks_by_job: Arc::new(RwLock::new(HashMap::new())),
            agents_by_status: Arc::new(RwLock::new(HashMap::new())),
            agents_by_type: Arc::new(RwLock::new(HashMap::new())),
            capability_index: Arc::new(RwLock::new(HashMap::new())),
            events: EventLog::new(),
        }
    }

    // ---- jobs ----

    pub async fn put_job(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let mut by_status = self.jobs_by_status.write().await;
        if let Some(existing) = jobs.get(&job.id) {
            by_status.entry(existing.status).or_default().remove(&job.id);
        }
        by_status.entry(job.status).or_default().insert(job.id.clone());
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn set_job_status(
        &self,
        id: &str,
        status: JobStatus,
        failure_reason: Option<String>,
    ) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {id}")))?;
        let mut by_status = self.jobs_by_status.write().await;
        by_status.entry(job.status).or_default().remove(id);
        job.status = status;
        job.updated_at = chrono::Utc::now();
        if let Some(reason) = failure_reason {
            job.failure_reason = Some(reason);
        }
        by_status.entry(status).or_default().insert(id.to_string());
        Ok(())
    }

    pub async fn jobs_with_status(&self, status: JobStatus) -> HashSet<String> {
        self.jobs_by_status
            .read()
            .await
            .get(&status)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn all_jobs(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }

    // ---- tasks ----

    pub async fn put_task(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let mut by_status = self.tasks_by_status.write().await;
        let mut by_agent_type = self.tasks_by_agent_type.write().await;
        let mut by_job = self.tasks_by_job.write().await;

        if let Some(existing) = tasks.get(&task.id) {
            by_status.entry(existing.status).or_default().remove(&task.id);
        } else {
            by_job.entry(task.job_id.clone()).or_default().insert(task.id.clone());
        }
        by_status.entry(task.status).or_default().insert(task.id.clone());
        by_agent_type
            .entry(task.agent_type.clone())
            .or_default()
            .insert(task.id.clone());
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    pub async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {id}")))?;
        let mut by_status = self.tasks_by_status.write().await;
        by_status.entry(task.status).or_default().remove(id);
        task.status = status;
        task.updated_at = chrono::Utc::now();
        by_status.entry(status).or_default().insert(id.to_string());
        Ok(())
    }

    pub async fn set_task_result(
        &self,
        id: &str,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
        assigned_agent_id: Option<String>,
    ) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {id}")))?;
        task.result = result;
        task.error = error;
        if assigned_agent_id.is_some() {
            task.assigned_agent_id = assigned_agent_id;
        }
        task.updated_at = chrono::Utc::now();
        Ok(())
    }

    pub async fn tasks_for_job(&self, job_id: &str) -> Vec<Task> {
        let ids = self
            .tasks_by_job
            .read()
            .await
            .get(job_id)
            .cloned()
            .unwrap_or_default();
        let tasks = self.tasks.read().await;
        ids.iter().filter_map(|id| tasks.get(id).cloned()).collect()
    }

    pub async fn tasks_with_status(&self, status: TaskStatus) -> HashSet<String> {
        self.tasks_by_status
            .read()
            .await
            .get(&status)
            .cloned()
            .unwrap_or_default()
    }

    // ---- features ----

    pub async fn put_feature(&self, feature: Feature) -> Result<()> {
        self.features.write().await.insert(feature.id.clone(), feature);
        Ok(())
    }

    pub async fn get_feature(&self, id: &str) -> Option<Feature> {
        self.features.read().await.get(id).cloned()
    }

    pub async fn update_feature<F>(&self, id: &str, update: F) -> Result<Feature>
    where
        F: FnOnce(&mut Feature),
    {
        let mut features = self.features.write().await;
        let feature = features
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("feature {id}")))?;
        update(feature);
        Ok(feature.clone())
    }

    // ---- agents ----

    pub async fn register_agent(&self, registration: AgentRegistration) -> Result<()> {
        let mut agents = self.agents.write().await;
        let mut by_status = self.agents_by_status.write().await;
        let mut by_type = self.agents_by_type.write().await;
        let mut capability_index = self.capability_index.write().await;

        if let Some(existing) = agents.get(&registration.id) {
            by_status.entry(existing.status).or_default().remove(&registration.id);
            if existing.status == RegistrationStatus::Active {
                for capability in &existing.capabilities {
                    capability_index
                        .entry(capability.clone())
                        .or_default()
                        .remove(&registration.id);
                }
            }
        }

        by_type
            .entry(registration.agent_type.clone())
            .or_default()
            .insert(registration.id.clone());
        by_status
            .entry(registration.status)
            .or_default()
            .insert(registration.id.clone());
        if registration.status == RegistrationStatus::Active {
            for capability in &registration.capabilities {
                capability_index
                    .entry(capability.clone())
                    .or_default()
                    .insert(registration.id.clone());
            }
        }

        let agent_id = registration.id.clone();
        let max_concurrent_tasks = registration.max_concurrent_tasks;
        agents.insert(agent_id.clone(), registration);
        drop(agents);
        drop(by_status);
        drop(by_type);
        drop(capability_index);

        let mut metrics = self.agent_metrics.write().await;
        metrics
            .entry(agent_id.clone())
            .or_insert_with(|| AgentMetrics::new(agent_id, max_concurrent_tasks.max(1)));
        Ok(())
    }

    pub async fn deregister_agent(&self, id: &str) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent {id}")))?;

        let mut by_status = self.agents_by_status.write().await;
        by_status.entry(agent.status).or_default().remove(id);

        if agent.status == RegistrationStatus::Active {
            let mut capability_index = self.capability_index.write().await;
            for capability in &agent.capabilities {
                capability_index.entry(capability.clone()).or_default().remove(id);
            }
        }

        agent.status = RegistrationStatus::Inactive;
        by_status
            .entry(RegistrationStatus::Inactive)
            .or_default()
            .insert(id.to_string());
        Ok(())
    }

    pub async fn touch_agent_heartbeat(&self, id: &str) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent {id}")))?;
        agent.last_seen = chrono::Utc::now();
        Ok(())
    }

    pub async fn get_agent(&self, id: &str) -> Option<AgentRegistration> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn all_agents(&self) -> Vec<AgentRegistration> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn agents_with_capability(&self, capability: &str) -> HashSet<String> {
        self.capability_index
            .read()
            .await
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn agents_of_type(&self, agent_type: &str) -> HashSet<String> {
        self.agents_by_type
            .read()
            .await
            .get(agent_type)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_agent_metrics(&self, id: &str) -> Option<AgentMetrics> {
        self.agent_metrics.read().await.get(id).cloned()
    }

    pub async fn update_agent_metrics<F>(&self, id: &str, update: F) -> Result<AgentMetrics>
    where
        F: FnOnce(&mut AgentMetrics),
    {
        let mut metrics = self.agent_metrics.write().await;
        let entry = metrics
            .entry(id.to_string())
            .or_insert_with(|| AgentMetrics::new(id.to_string(), 1));
        update(entry);
        Ok(entry.clone())
    }

    // ---- circuit breakers ----

    pub async fn get_circuit_breaker(&self, agent_id: &str) -> CircuitBreakerState {
        self.circuit_breakers
            .read()
            .await
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| CircuitBreakerState::new(agent_id.to_string()))
    }

    pub async fn update_circuit_breaker<F>(&self, agent_id: &str, update: F) -> CircuitBreakerState
    where
        F: FnOnce(&mut CircuitBreakerState),
    {
        let mut breakers = self.circuit_breakers.write().await;
        let entry = breakers
            .entry(agent_id.to_string())
            .or_insert_with(|| CircuitBreakerState::new(agent_id.to_string()));
        update(entry);
        entry.clone()
    }

    pub async fn all_circuit_breakers(&self) -> HashMap<String, CircuitBreakerState> {
        self.circuit_breakers.read().await.clone()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_status_index_moves_on_update() {
        let store = Store::new();
        let job = Job::new("j1".into(), "do it".into(), Priority::Normal, vec![]);
        store.put_job(job).await.unwrap();
        assert!(store.jobs_with_status(JobStatus::Planning).await.contains("j1"));

        store.set_job_status("j1", JobStatus::Running, None).await.unwrap();
        assert!(!store.jobs_with_status(JobStatus::Planning).await.contains("j1"));
        assert!(store.jobs_with_status(JobStatus::Running).await.contains("j1"));
    }

    #[tokio::test]
    async fn capability_index_only_tracks_active_agents() {
        let store = Store::new();
        let now = chrono::Utc::now();
        let mut registration = AgentRegistration {
            id: "a1".into(),
            agent_type: "coding".into(),
            capabilities: ["rust".to_string()].into_iter().collect(),
            version: "1.0".into(),
            max_concurrent_tasks: 4,
            priority: 10,
            tags: vec![],
            host: None,
            port: None,
            endpoint: None,
            status: RegistrationStatus::Pending,
            registered_at: now,
            last_seen: now,
        };
        store.register_agent(registration.clone()).await.unwrap();
        assert!(!store.agents_with_capability("rust").await.contains("a1"));

        registration.status = RegistrationStatus::Active;
        store.register_agent(registration).await.unwrap();
        assert!(store.agents_with_capability("rust").await.contains("a1"));

        store.deregister_agent("a1").await.unwrap();
        assert!(!store.agents_with_capability("rust").await.contains("a1"));
    }

    #[tokio::test]
    async fn task_status_reindexes_without_duplicating_job_index() {
        let store = Store::new();
        let task = Task::new(
            "t1".into(),
            "j1".into(),
            "coding".into(),
            "write code".into(),
            HashSet::new(),
        );
        store.put_task(task).await.unwrap();
        store.set_task_status("t1", TaskStatus::Queued).await.unwrap();
        store.set_task_status("t1", TaskStatus::Running).await.unwrap();

        assert!(store.tasks_with_status(TaskStatus::Running).await.contains("t1"));
        assert!(!store.tasks_with_status(TaskStatus::Queued).await.contains("t1"));

        let tasks = store.tasks_for_job("j1").await;
        assert_eq!(tasks.len(), 1);
    }
}
