//! The uniform contract every worker, in-process or remote-backed, implements.
//! The core never special-cases an agent type: routing and discovery match on
//! declared capabilities, not on which concrete `Agent` impl is behind them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Everything an agent needs to do its job, and nothing it needs to know
/// about the executor, the store, or the router that dispatched it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    pub task_id: String,
    pub job_id: String,
    pub agent_type: String,
    pub description: String,
    pub priority: u32,
    pub required_capabilities: Vec<String>,
    pub preferred_tags: Vec<String>,
    pub timeout_seconds: u64,
    pub metadata: HashMap<String, Value>,
}

/// The per-agent-type structured payload. The core does not interpret these
/// fields; it only passes them through to the stream and the job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub output: String,
    pub structured: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentError {
    pub error_type: String,
    pub message: String,
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for AgentError {}

#[async_trait]
pub trait Agent: Send + Sync {
    fn agent_type(&self) -> &str;

    fn capabilities(&self) -> &[String];

    async fn invoke(&self, context: AgentContext) -> Result<AgentOutcome, AgentError>;
}

/// Echoes its input back as output. Useful as a default stand-in for task
/// types under active development, and in tests that exercise the executor
/// and router without needing a real worker.
pub struct EchoAgent {
    agent_type: String,
    capabilities: Vec<String>,
}

impl EchoAgent {
    pub fn new(agent_type: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            capabilities,
        }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn invoke(&self, context: AgentContext) -> Result<AgentOutcome, AgentError> {
        Ok(AgentOutcome {
            output: format!("echo: {}", context.description),
            structured: None,
        })
    }
}

/// Replays a fixed, ordered sequence of scripted responses. Each call to
/// `invoke` consumes the next entry; exhausting the script is itself an
/// `AgentError`, which lets tests assert on exact call counts.
pub struct ScriptedAgent {
    agent_type: String,
    capabilities: Vec<String>,
    responses: tokio::sync::Mutex<std::collections::VecDeque<Result<AgentOutcome, AgentError>>>,
}

impl ScriptedAgent {
    pub fn new(
        agent_type: impl Into<String>,
        capabilities: Vec<String>,
        responses: Vec<Result<AgentOutcome, AgentError>>,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            capabilities,
            responses: tokio::sync::Mutex::new(responses.into()),
        }
    }

    pub fn success(output: impl Into<String>) -> Result<AgentOutcome, AgentError> {
        Ok(AgentOutcome {
            output: output.into(),
            structured: None,
        })
    }

    pub fn success_structured(output: impl Into<String>, structured: Value) -> Result<AgentOutcome, AgentError> {
        Ok(AgentOutcome {
            output: output.into(),
            structured: Some(structured),
        })
    }

    pub fn failure(
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<AgentOutcome, AgentError> {
        Err(AgentError {
            error_type: error_type.into(),
            message: message.into(),
        })
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn invoke(&self, _context: AgentContext) -> Result<AgentOutcome, AgentError> {
        let mut responses = self.responses.lock().await;
        responses.pop_front().unwrap_or_else(|| {
            Err(AgentError {
                error_type: "script_exhausted".to_string(),
                message: "scripted agent has no more responses queued".to_string(),
            })
        })
    }
}

/// Clamps a raw per-task timeout into a usable `Duration`, falling back to a
/// sane floor when a caller supplies zero.
pub fn task_deadline(context: &AgentContext) -> Duration {
    Duration::from_secs(context.timeout_seconds.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> AgentContext {
        AgentContext {
            task_id: "t1".to_string(),
            job_id: "j1".to_string(),
            agent_type: "coding".to_string(),
            description: "write a function".to_string(),
            priority: 5,
            required_capabilities: vec!["rust".to_string()],
            preferred_tags: vec![],
            timeout_seconds: 30,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn echo_agent_reflects_description() {
        let agent = EchoAgent::new("coding", vec!["rust".to_string()]);
        let outcome = agent.invoke(context()).await.unwrap();
        assert_eq!(outcome.output, "echo: write a function");
    }

    #[tokio::test]
    async fn scripted_agent_replays_in_order() {
        let agent = ScriptedAgent::new(
            "coding",
            vec!["rust".to_string()],
            vec![
                ScriptedAgent::success("first"),
                ScriptedAgent::failure("agent_error", "second failed"),
            ],
        );
        let first = agent.invoke(context()).await.unwrap();
        assert_eq!(first.output, "first");

        let second = agent.invoke(context()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn scripted_agent_errors_when_exhausted() {
        let agent = ScriptedAgent::new("coding", vec![], vec![]);
        let result = agent.invoke(context()).await;
        assert_eq!(result.unwrap_err().error_type, "script_exhausted");
    }

    #[test]
    fn task_deadline_floors_at_one_second() {
        let mut ctx = context();
        ctx.timeout_seconds = 0;
        assert_eq!(task_deadline(&ctx), Duration::from_secs(1));
    }
}
