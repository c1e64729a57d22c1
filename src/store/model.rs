//! Record shapes owned by the state store. Only the owning component mutates
//! a given kind (tasks: the executor; features: the TDD engine; agents: the
//! coordination plane) — the store itself just holds and indexes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Planning,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub user_request: String,
    pub status: JobStatus,
    pub task_ids: Vec<String>,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

impl Job {
    pub fn new(id: String, user_request: String, priority: Priority, tags: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_request,
            status: JobStatus::Planning,
            task_ids: Vec::new(),
            priority,
            tags,
            created_at: now,
            updated_at: now,
            failure_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub job_id: String,
    pub agent_type: String,
    pub status: TaskStatus,
    pub description: String,
    pub dependencies: HashSet<String>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub assigned_agent_id: Option<String>,
    pub use_tdd: bool,
    pub feature_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: String,
        job_id: String,
        agent_type: String,
        description: String,
        dependencies: HashSet<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_id,
            agent_type,
            status: TaskStatus::Pending,
            description,
            dependencies,
            result: None,
            error: None,
            assigned_agent_id: None,
            use_tdd: false,
            feature_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Red,
    Yellow,
    Green,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestAttempt {
    pub attempt: u32,
    pub passed: u32,
    pub failed: u32,
    pub newly_passed: HashSet<String>,
    pub persistent_failures: HashSet<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub job_id: String,
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub phase: Phase,
    pub transitions: Vec<PhaseTransition>,
    pub phase_duration_ms: HashMap<Phase, u64>,
    pub fix_iterations: u32,
    pub review_attempts: u32,
    pub test_history: Vec<TestAttempt>,
    pub failing_tests: HashSet<String>,
    pub persistent_failures: HashSet<String>,
    pub tests_written: bool,
    pub test_file_count: u32,
    pub test_function_count: u32,
    pub review_feedback: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub phase_entered_at: DateTime<Utc>,
}

impl Feature {
    pub fn new(id: String, job_id: String, task_id: String, title: String, description: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_id,
            task_id,
            title,
            description,
            phase: Phase::Red,
            transitions: Vec::new(),
            phase_duration_ms: HashMap::new(),
            fix_iterations: 0,
            review_attempts: 0,
            test_history: Vec::new(),
            failing_tests: HashSet::new(),
            persistent_failures: HashSet::new(),
            tests_written: false,
            test_file_count: 0,
            test_function_count: 0,
            review_feedback: Vec::new(),
            created_at: now,
            phase_entered_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    Pending,
    Active,
    Inactive,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: String,
    pub agent_type: String,
    pub capabilities: HashSet<String>,
    pub version: String,
    pub max_concurrent_tasks: u32,
    pub priority: u32,
    pub tags: Vec<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub endpoint: Option<String>,
    pub status: RegistrationStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
    Initializing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub status: AgentHealthStatus,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub current_load: u32,
    pub max_concurrency: u32,
    pub avg_response_time_ms: f64,
    pub errors_recent: u64,
    pub errors_today: u64,
    pub performance_score: f64,
    pub reliability_score: f64,
    pub availability_score: f64,
    pub task_started_at: HashMap<String, DateTime<Utc>>,
}

impl AgentMetrics {
    pub fn new(agent_id: String, max_concurrency: u32) -> Self {
        Self {
            agent_id,
            status: AgentHealthStatus::Initializing,
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            current_load: 0,
            max_concurrency,
            avg_response_time_ms: 0.0,
            errors_recent: 0,
            errors_today: 0,
            performance_score: 100.0,
            reliability_score: 100.0,
            availability_score: 100.0,
            task_started_at: HashMap::new(),
        }
    }

    pub fn overall_score(&self) -> f64 {
        0.4 * self.performance_score + 0.4 * self.reliability_score + 0.2 * self.availability_score
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub agent_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub open_until: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    pub fn new(agent_id: String) -> Self {
        Self {
            agent_id,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            open_until: None,
        }
    }
}
