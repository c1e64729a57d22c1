use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

/// Convenience alias used throughout the crate instead of `anyhow::Result` or
/// ad hoc `Result<T, String>` in library code.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// The error taxonomy from the error-handling design: every failure mode the
/// core can hit maps to exactly one variant here.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("agent error ({category}): {message}")]
    AgentError { category: String, message: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("plan cycle detected among tasks: {0}")]
    PlanCycle(String),

    #[error("unknown agent type in plan: {0}")]
    PlanUnknownAgent(String),

    #[error("routing failed: {0}")]
    RoutingFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    fn status_code(&self) -> StatusCode {
        match self {
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Unauthorized => StatusCode::UNAUTHORIZED,
            OrchestratorError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            OrchestratorError::PlanCycle(_) | OrchestratorError::PlanUnknownAgent(_) => {
                StatusCode::BAD_REQUEST
            }
            OrchestratorError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            OrchestratorError::StoreUnavailable(_) | OrchestratorError::RoutingFailed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable category, used as the `error` field of the HTTP envelope
    /// and as the FAILED task's error category.
    pub fn category(&self) -> &'static str {
        match self {
            OrchestratorError::Config(_) => "config",
            OrchestratorError::Validation(_) => "validation",
            OrchestratorError::StoreUnavailable(_) => "store_unavailable",
            OrchestratorError::AgentError { .. } => "agent_error",
            OrchestratorError::Timeout(_) => "timeout",
            OrchestratorError::PlanCycle(_) => "plan_cycle",
            OrchestratorError::PlanUnknownAgent(_) => "plan_unknown_agent",
            OrchestratorError::RoutingFailed(_) => "routing_failed",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Unauthorized => "unauthorized",
            OrchestratorError::RateLimited => "rate_limited",
            OrchestratorError::Serialization(_) => "internal_error",
            OrchestratorError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.category(),
            "detail": self.to_string(),
        }));
        (status, body).into_response()
    }
}
