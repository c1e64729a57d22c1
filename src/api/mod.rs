//! Authenticated, rate-limited HTTP surface tying the store, coordination
//! plane, executor, and streaming gateway together. Route handlers are thin:
//! validate and sanitize input, call one core method, map the result to a
//! DTO.

use crate::auth::{auth_middleware, create_auth_state};
use crate::config::{ApiConfig, Config};
use crate::coordination::{DiscoveryService, Router};
use crate::error::{OrchestratorError, Result};
use crate::executor::Executor;
use crate::monitoring::SystemMonitor;
use crate::rate_limit::{rate_limit_middleware, RateLimitConfig};
use crate::store::model::{AgentRegistration, Job, Priority, Task};
use crate::store::Store;
use crate::streaming::StreamingGateway;
use crate::validation::RequestValidator;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::sse::{Event, Sse},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router as AxumRouter,
};
use futures::stream::{self, Stream as FuturesStream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

const SERVICE_NAME: &str = "forge-orchestrator";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_HEALTH: &str = "/health";
const ROUTE_SYSTEM_HEALTH: &str = "/system/health";
const ROUTE_JOBS: &str = "/jobs";
const ROUTE_JOB_BY_ID: &str = "/jobs/{job_id}";
const ROUTE_JOB_STREAM: &str = "/jobs/{job_id}/stream";
const ROUTE_JOB_WS: &str = "/jobs/{job_id}/ws";
const ROUTE_STREAM: &str = "/stream";
const ROUTE_WS: &str = "/ws";
const ROUTE_AGENTS_DISCOVER: &str = "/agents/discover";
const ROUTE_AGENT_HEARTBEAT: &str = "/agents/{agent_id}/heartbeat";
const ROUTE_AGENT_BY_ID: &str = "/agents/{agent_id}";
const ROUTE_ROUTING_STATISTICS: &str = "/routing/statistics";

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    store: Arc<Store>,
    executor: Arc<Executor>,
    discovery: Arc<DiscoveryService>,
    router: Arc<Router>,
    streaming: Arc<StreamingGateway>,
    validator: Arc<RequestValidator>,
    rate_limits: Arc<RateLimitConfig>,
    system_monitor: Option<Arc<SystemMonitor>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub user_request: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job: Job,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
pub struct JobListParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub total_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct DiscoverAgentsRequest {
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub preferred_tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DiscoverAgentsResponse {
    pub agents: Vec<AgentRegistration>,
}

#[derive(Debug, Serialize)]
pub struct RoutingStatisticsResponse {
    pub circuit_breakers: std::collections::HashMap<String, crate::store::model::CircuitBreakerState>,
    pub recent_decisions: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: Arc<Store>,
        executor: Arc<Executor>,
        discovery: Arc<DiscoveryService>,
        router: Arc<Router>,
        streaming: Arc<StreamingGateway>,
    ) -> Result<Self> {
        let validator = Arc::new(RequestValidator::new()?);
        Ok(Self {
            config: config.api,
            store,
            executor,
            discovery,
            router,
            streaming,
            validator,
            rate_limits: Arc::new(RateLimitConfig::new()),
            system_monitor: None,
        })
    }

    pub fn with_system_monitor(mut self, monitor: Arc<SystemMonitor>) -> Self {
        self.system_monitor = Some(monitor);
        self
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();

        let addr: std::net::SocketAddr = self
            .config
            .bind_address
            .parse()
            .map_err(|e| OrchestratorError::Config(format!("invalid bind address: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;

        info!(%addr, "API server listening");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .map_err(|e| OrchestratorError::Internal(e.into()))?;

        Ok(())
    }

    /// Layering order matters: rate limit rejects before auth does any
    /// constant-time comparison work, trace wraps both, cors is outermost.
    pub fn build_router(&self) -> AxumRouter {
        let auth_state = create_auth_state(self.config.clone());

        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::DELETE,
            ])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ])
            .max_age(std::time::Duration::from_secs(3600));

        AxumRouter::new()
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_SYSTEM_HEALTH, get(get_system_health))
            .route(ROUTE_JOBS, post(create_job).get(list_jobs))
            .route(ROUTE_JOB_BY_ID, get(get_job))
            .route(ROUTE_JOB_STREAM, get(stream_job_sse))
            .route(ROUTE_JOB_WS, get(stream_job_ws))
            .route(ROUTE_STREAM, get(stream_global_sse))
            .route(ROUTE_WS, get(stream_global_ws))
            .route(ROUTE_AGENTS_DISCOVER, post(discover_agents))
            .route(ROUTE_AGENT_HEARTBEAT, post(agent_heartbeat))
            .route(ROUTE_AGENT_BY_ID, delete(deregister_agent))
            .route(ROUTE_ROUTING_STATISTICS, get(routing_statistics))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(
                        Arc::clone(&self.rate_limits),
                        rate_limit_middleware,
                    ))
                    .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.clone())
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

async fn get_system_health(State(server): State<ApiServer>) -> Json<serde_json::Value> {
    match &server.system_monitor {
        Some(monitor) => {
            let status = monitor.get_health_status().await;
            Json(json!({"status": status, "service": SERVICE_NAME, "version": SERVICE_VERSION}))
        }
        None => Json(json!({"status": "unknown", "error": "monitoring not available"})),
    }
}

async fn create_job(
    State(server): State<ApiServer>,
    Json(request): Json<CreateJobRequest>,
) -> std::result::Result<(StatusCode, Json<CreateJobResponse>), Response> {
    let sanitized = server
        .validator
        .validate_and_sanitize_user_request(&request.user_request)
        .map_err(err_response)?;

    let mut sanitized_tags = Vec::with_capacity(request.tags.len());
    for tag in &request.tags {
        sanitized_tags.push(
            server
                .validator
                .validate_and_sanitize_tag(tag)
                .map_err(err_response)?,
        );
    }

    let job = server
        .executor
        .create_job(sanitized, request.priority.unwrap_or(Priority::Normal), sanitized_tags)
        .await
        .map_err(err_response)?;

    info!(job_id = %job.id, "job submitted");
    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: job.id,
            status: "PLANNING".to_string(),
        }),
    ))
}

async fn get_job(
    State(server): State<ApiServer>,
    Path(job_id): Path<String>,
) -> std::result::Result<Json<JobResponse>, Response> {
    let job = server
        .store
        .get_job(&job_id)
        .await
        .ok_or_else(|| err_response(OrchestratorError::NotFound(format!("job {job_id}"))))?;
    let tasks = server.store.tasks_for_job(&job_id).await;
    Ok(Json(JobResponse { job, tasks }))
}

async fn list_jobs(
    State(server): State<ApiServer>,
    Query(params): Query<JobListParams>,
) -> Json<JobListResponse> {
    let mut jobs = server.store.all_jobs().await;
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if let Some(limit) = params.limit {
        jobs.truncate(limit);
    }
    let total_count = jobs.len();
    Json(JobListResponse { jobs, total_count })
}

async fn discover_agents(
    State(server): State<ApiServer>,
    Json(request): Json<DiscoverAgentsRequest>,
) -> Json<DiscoverAgentsResponse> {
    let agents = server
        .discovery
        .list_matching(
            request.agent_type.as_deref(),
            &request.required_capabilities,
            &request.preferred_tags,
        )
        .await;
    Json(DiscoverAgentsResponse { agents })
}

async fn agent_heartbeat(
    State(server): State<ApiServer>,
    Path(agent_id): Path<String>,
) -> std::result::Result<StatusCode, Response> {
    server
        .discovery
        .heartbeat(&agent_id)
        .await
        .map_err(err_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deregister_agent(
    State(server): State<ApiServer>,
    Path(agent_id): Path<String>,
) -> std::result::Result<StatusCode, Response> {
    server
        .discovery
        .deregister(&agent_id)
        .await
        .map_err(err_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn routing_statistics(State(server): State<ApiServer>) -> Json<RoutingStatisticsResponse> {
    let circuit_breakers = server.store.all_circuit_breakers().await;
    let recent_decisions = server
        .store
        .events
        .len(crate::store::event_log::ROUTING_DECISIONS)
        .await;
    Json(RoutingStatisticsResponse {
        circuit_breakers,
        recent_decisions,
    })
}

fn err_response(e: OrchestratorError) -> Response {
    e.into_response()
}

async fn stream_job_sse(
    State(server): State<ApiServer>,
    Path(job_id): Path<String>,
) -> std::result::Result<Sse<impl FuturesStream<Item = std::result::Result<Event, std::convert::Infallible>>>, Response>
{
    let subscription = server
        .streaming
        .subscribe_job(&job_id)
        .await
        .ok_or_else(|| err_response(OrchestratorError::NotFound(format!("job {job_id}"))))?;

    Ok(Sse::new(sse_stream(subscription)).keep_alive(axum::response::sse::KeepAlive::default()))
}

async fn stream_global_sse(
    State(server): State<ApiServer>,
) -> Sse<impl FuturesStream<Item = std::result::Result<Event, std::convert::Infallible>>> {
    let subscription = server.streaming.subscribe_global().await;
    Sse::new(sse_stream(subscription)).keep_alive(axum::response::sse::KeepAlive::default())
}

fn sse_stream(
    subscription: crate::streaming::Subscription,
) -> impl FuturesStream<Item = std::result::Result<Event, std::convert::Infallible>> {
    stream::unfold(subscription, |sub| async move {
        sub.recv()
            .await
            .map(|frame| (Ok(Event::default().data(frame.to_string())), sub))
    })
}

async fn stream_job_ws(
    State(server): State<ApiServer>,
    Path(job_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_job_ws(socket, server, job_id))
}

async fn handle_job_ws(mut socket: WebSocket, server: ApiServer, job_id: String) {
    let Some(subscription) = server.streaming.subscribe_job(&job_id).await else {
        let _ = socket
            .send(Message::Text(server.streaming.unknown_job_error(&job_id).to_string().into()))
            .await;
        let _ = socket.close().await;
        return;
    };
    run_ws_loop(socket, subscription).await;
}

async fn stream_global_ws(State(server): State<ApiServer>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let subscription = server.streaming.subscribe_global().await;
        run_ws_loop(socket, subscription).await;
    })
}

/// Forwards queued events to the client and answers client pings; a
/// malformed or unrecognized client frame gets an `error` frame back rather
/// than closing the socket.
async fn run_ws_loop(mut socket: WebSocket, subscription: crate::streaming::Subscription) {
    loop {
        tokio::select! {
            event = subscription.recv() => {
                match event {
                    Some(frame) => {
                        if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = crate::streaming::handle_client_frame(&text);
                        if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }
}
