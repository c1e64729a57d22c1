//! Task-to-agent routing. `route` makes one selection attempt with a given
//! strategy; `route_with_retry` is what the executor actually calls — it
//! walks the fallback chain for the primary strategy with exponential
//! backoff between attempts and records every decision to the
//! routing-decisions stream.

use crate::coordination::circuit_breaker;
use crate::store::event_log;
use crate::store::model::{AgentHealthStatus, AgentMetrics, AgentRegistration, Priority, RegistrationStatus};
use crate::store::Store;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingStrategy {
    RoundRobin,
    LeastLoaded,
    WeightedRandom,
    HealthAware,
    PriorityBased,
}

impl RoutingStrategy {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "round_robin" => RoutingStrategy::RoundRobin,
            "least_loaded" => RoutingStrategy::LeastLoaded,
            "weighted_random" => RoutingStrategy::WeightedRandom,
            "priority_based" => RoutingStrategy::PriorityBased,
            _ => RoutingStrategy::HealthAware,
        }
    }

    /// Fallback chain tried, in order, after this strategy fails to find a
    /// candidate. The primary is never repeated.
    fn fallbacks(self) -> &'static [RoutingStrategy] {
        match self {
            RoutingStrategy::HealthAware => &[RoutingStrategy::LeastLoaded, RoutingStrategy::RoundRobin],
            RoutingStrategy::RoundRobin => &[RoutingStrategy::HealthAware, RoutingStrategy::LeastLoaded],
            RoutingStrategy::LeastLoaded => &[RoutingStrategy::HealthAware, RoutingStrategy::RoundRobin],
            RoutingStrategy::WeightedRandom => &[RoutingStrategy::HealthAware, RoutingStrategy::LeastLoaded],
            RoutingStrategy::PriorityBased => &[RoutingStrategy::HealthAware, RoutingStrategy::LeastLoaded],
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub task_id: String,
    pub agent_type: String,
    pub required_capabilities: Vec<String>,
    pub preferred_tags: Vec<String>,
    pub exclude: HashSet<String>,
    pub priority: Priority,
    pub strategy: Option<RoutingStrategy>,
    pub max_retries: u32,
    /// Overall wall-clock budget for `route_with_retry`'s whole fallback
    /// chain, not a per-attempt limit.
    pub timeout: Duration,
}

impl RouteRequest {
    pub fn new(task_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_type: agent_type.into(),
            required_capabilities: Vec::new(),
            preferred_tags: Vec::new(),
            exclude: HashSet::new(),
            priority: Priority::Normal,
            strategy: None,
            max_retries: crate::constants::DEFAULT_ROUTER_MAX_RETRIES,
            timeout: crate::constants::DEFAULT_ROUTER_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteResult {
    pub success: bool,
    pub agent_id: Option<String>,
    pub strategy_used: Option<RoutingStrategy>,
    pub attempts: u32,
    pub reason: Option<String>,
}

impl RouteResult {
    fn failure(reason: &str, attempts: u32) -> Self {
        Self {
            success: false,
            agent_id: None,
            strategy_used: None,
            attempts,
            reason: Some(reason.to_string()),
        }
    }

    fn success(agent_id: String, strategy: RoutingStrategy, attempts: u32) -> Self {
        Self {
            success: true,
            agent_id: Some(agent_id),
            strategy_used: Some(strategy),
            attempts,
            reason: None,
        }
    }
}

pub struct Router {
    store: Arc<Store>,
    default_strategy: RoutingStrategy,
    circuit_breaker_threshold: u32,
    circuit_breaker_timeout: std::time::Duration,
    round_robin_cursors: RwLock<std::collections::HashMap<String, usize>>,
}

impl Router {
    pub fn new(store: Arc<Store>, config: &crate::config::CoordinationConfig) -> Self {
        Self {
            store,
            default_strategy: RoutingStrategy::parse(&config.default_routing_strategy),
            circuit_breaker_threshold: config.circuit_breaker_threshold,
            circuit_breaker_timeout: config.circuit_breaker_timeout,
            round_robin_cursors: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// One selection attempt with a single strategy. Never blocks beyond
    /// the store reads it performs.
    pub async fn route(&self, req: &RouteRequest, strategy: RoutingStrategy) -> RouteResult {
        let candidates = self.candidates(req).await;
        if candidates.is_empty() {
            return RouteResult::failure("no_candidates", 1);
        }

        let chosen = match strategy {
            RoutingStrategy::RoundRobin => self.pick_round_robin(&req.agent_type, &candidates).await,
            RoutingStrategy::LeastLoaded => self.pick_least_loaded(&candidates),
            RoutingStrategy::WeightedRandom => self.pick_weighted_random(&candidates),
            RoutingStrategy::HealthAware => self.pick_health_aware(req, &candidates),
            RoutingStrategy::PriorityBased => self.pick_priority_based(req, &candidates),
        };

        match chosen {
            Some(agent_id) => RouteResult::success(agent_id, strategy, 1),
            None => RouteResult::failure("no_candidates", 1),
        }
    }

    /// The executor's entry point: tries the requested (or default)
    /// strategy, then its fallback chain, sleeping `min(2^attempt, 10)`s
    /// between attempts. `req.timeout` bounds the whole chain as an overall
    /// wall-clock budget, not a per-attempt one: once it elapses the loop
    /// stops even if retries remain. Every attempt is recorded to the
    /// routing-decisions stream regardless of outcome.
    pub async fn route_with_retry(&self, req: &RouteRequest) -> RouteResult {
        let primary = req.strategy.unwrap_or(self.default_strategy);
        let mut chain = vec![primary];
        chain.extend_from_slice(primary.fallbacks());

        let deadline = Instant::now() + req.timeout;
        let mut attempt = 0u32;
        let mut last_reason = "no_candidates".to_string();

        for strategy in chain {
            if attempt >= req.max_retries {
                break;
            }
            let mut remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last_reason = "timeout".to_string();
                break;
            }
            if attempt > 0 {
                let backoff = Duration::from_secs(2u64.pow(attempt).min(10)).min(remaining);
                tokio::time::sleep(backoff).await;
                remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    last_reason = "timeout".to_string();
                    break;
                }
            }
            attempt += 1;

            let result = match tokio::time::timeout(remaining, self.route(req, strategy)).await {
                Ok(result) => result,
                Err(_) => {
                    last_reason = "timeout".to_string();
                    break;
                }
            };
            self.record_decision(req, &result, attempt).await;

            if result.success {
                return RouteResult { attempts: attempt, ..result };
            }
            last_reason = result.reason.unwrap_or(last_reason);
        }

        RouteResult::failure(&last_reason, attempt.max(1))
    }

    async fn candidates(&self, req: &RouteRequest) -> Vec<(AgentRegistration, AgentMetrics)> {
        let mut out = Vec::new();
        for id in self.store.agents_of_type(&req.agent_type).await {
            if req.exclude.contains(&id) {
                continue;
            }
            let Some(agent) = self.store.get_agent(&id).await else {
                continue;
            };
            if agent.status != RegistrationStatus::Active {
                continue;
            }
            if !req
                .required_capabilities
                .iter()
                .all(|cap| agent.capabilities.contains(cap))
            {
                continue;
            }
            if circuit_breaker::is_open(&self.store, &id).await {
                continue;
            }
            let metrics = self
                .store
                .get_agent_metrics(&id)
                .await
                .unwrap_or_else(|| AgentMetrics::new(id.clone(), agent.max_concurrent_tasks.max(1)));
            if metrics.status == AgentHealthStatus::Offline {
                continue;
            }
            out.push((agent, metrics));
        }
        out
    }

    async fn pick_round_robin(
        &self,
        agent_type: &str,
        candidates: &[(AgentRegistration, AgentMetrics)],
    ) -> Option<String> {
        let mut cursors = self.round_robin_cursors.write().await;
        let cursor = cursors.entry(agent_type.to_string()).or_insert(0);
        let idx = *cursor % candidates.len();
        *cursor = cursor.wrapping_add(1);
        candidates.get(idx).map(|(a, _)| a.id.clone())
    }

    fn pick_least_loaded(&self, candidates: &[(AgentRegistration, AgentMetrics)]) -> Option<String> {
        candidates
            .iter()
            .min_by_key(|(_, m)| m.current_load)
            .map(|(a, _)| a.id.clone())
    }

    fn pick_weighted_random(&self, candidates: &[(AgentRegistration, AgentMetrics)]) -> Option<String> {
        let weights: Vec<f64> = candidates
            .iter()
            .map(|(_, m)| m.overall_score().max(1.0))
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return candidates.first().map(|(a, _)| a.id.clone());
        }
        let mut draw = rand::thread_rng().gen_range(0.0..total);
        for (i, w) in weights.iter().enumerate() {
            if draw < *w {
                return candidates.get(i).map(|(a, _)| a.id.clone());
            }
            draw -= w;
        }
        candidates.last().map(|(a, _)| a.id.clone())
    }

    fn pick_health_aware(
        &self,
        req: &RouteRequest,
        candidates: &[(AgentRegistration, AgentMetrics)],
    ) -> Option<String> {
        candidates
            .iter()
            .max_by(|a, b| {
                self.health_aware_score(req, a)
                    .partial_cmp(&self.health_aware_score(req, b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(a, _)| a.id.clone())
    }

    fn health_aware_score(&self, req: &RouteRequest, candidate: &(AgentRegistration, AgentMetrics)) -> f64 {
        let (agent, metrics) = candidate;
        let load_headroom = 1.0 - (metrics.current_load as f64 / metrics.max_concurrency.max(1) as f64);
        let response_time_score =
            (100.0 - (metrics.avg_response_time_ms / 1000.0 - 1.0).max(0.0) * 10.0).max(0.0);
        let priority_bonus = (1000.0 - agent.priority as f64) / 100.0;
        let tag_bonus = agent
            .tags
            .iter()
            .filter(|t| req.preferred_tags.contains(t))
            .count() as f64
            * 5.0;

        0.4 * metrics.overall_score()
            + 0.3 * load_headroom * 100.0
            + 0.2 * metrics.reliability_score
            + 0.1 * response_time_score
            + priority_bonus
            + tag_bonus
    }

    fn pick_priority_based(
        &self,
        req: &RouteRequest,
        candidates: &[(AgentRegistration, AgentMetrics)],
    ) -> Option<String> {
        let mut sorted: Vec<&(AgentRegistration, AgentMetrics)> = candidates.iter().collect();
        sorted.sort_by_key(|(a, _)| a.priority);

        if req.priority == Priority::Critical {
            return sorted.first().map(|(a, _)| a.id.clone());
        }

        let top = &sorted[..sorted.len().min(3)];
        top.iter()
            .min_by_key(|(_, m)| m.current_load)
            .map(|(a, _)| a.id.clone())
    }

    async fn record_decision(&self, req: &RouteRequest, result: &RouteResult, attempt: u32) {
        self.store
            .events
            .append(
                event_log::ROUTING_DECISIONS,
                json!({
                    "event_type": "routing_decision",
                    "task_id": req.task_id,
                    "agent_type": req.agent_type,
                    "attempt": attempt,
                    "success": result.success,
                    "agent_id": result.agent_id,
                    "strategy_used": result.strategy_used,
                    "reason": result.reason,
                    "timestamp": chrono::Utc::now(),
                }),
            )
            .await;

        if !result.success {
            warn!(
                task_id = %req.task_id,
                agent_type = %req.agent_type,
                attempt,
                "routing attempt failed"
            );
        }
    }

    pub fn circuit_breaker_threshold(&self) -> u32 {
        self.circuit_breaker_threshold
    }

    pub fn circuit_breaker_timeout(&self) -> std::time::Duration {
        self.circuit_breaker_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;
    use chrono::Utc;
    use std::time::Duration;

    fn config() -> CoordinationConfig {
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

    async fn registered(store: &Store, id: &str, priority: u32, load: u32) {
        let now = Utc::now();
        store
            .register_agent(AgentRegistration {
                id: id.to_string(),
                agent_type: "coding".to_string(),
                capabilities: Default::default(),
                version: "1.0".to_string(),
                max_concurrent_tasks: 4,
                priority,
                tags: vec![],
                host: None,
                port: None,
                endpoint: None,
                status: RegistrationStatus::Active,
                registered_at: now,
                last_seen: now,
            })
            .await
            .unwrap();
        store
            .update_agent_metrics(id, |m| {
                m.status = AgentHealthStatus::Healthy;
                m.current_load = load;
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn least_loaded_picks_lowest_current_load() {
        let store = Arc::new(Store::new());
        registered(&store, "a1", 10, 3).await;
        registered(&store, "a2", 10, 1).await;
        let router = Router::new(Arc::clone(&store), &config());
        let req = RouteRequest::new("t1", "coding");
        let result = router.route(&req, RoutingStrategy::LeastLoaded).await;
        assert_eq!(result.agent_id.as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn priority_based_picks_top_one_for_critical() {
        let store = Arc::new(Store::new());
        registered(&store, "a1", 50, 0).await;
        registered(&store, "a2", 5, 0).await;
        let router = Router::new(Arc::clone(&store), &config());
        let mut req = RouteRequest::new("t1", "coding");
        req.priority = Priority::Critical;
        let result = router.route(&req, RoutingStrategy::PriorityBased).await;
        assert_eq!(result.agent_id.as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn route_with_retry_fails_cleanly_with_no_agents() {
        let store = Arc::new(Store::new());
        let router = Router::new(Arc::clone(&store), &config());
        let req = RouteRequest::new("t1", "coding");
        let result = router.route_with_retry(&req).await;
        assert!(!result.success);
        assert_eq!(result.reason.as_deref(), Some("no_candidates"));
    }

    #[tokio::test]
    async fn excluded_agent_is_never_selected() {
        let store = Arc::new(Store::new());
        registered(&store, "a1", 10, 0).await;
        let router = Router::new(Arc::clone(&store), &config());
        let mut req = RouteRequest::new("t1", "coding");
        req.exclude.insert("a1".to_string());
        let result = router.route(&req, RoutingStrategy::HealthAware).await;
        assert!(!result.success);
    }
}
