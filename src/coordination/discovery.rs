//! Agent registration and capability-based lookup. The scan loop consumes
//! the agent-announcements stream; register/deregister can also be called
//! directly (the API surface's `POST /agents/discover` path and tests both
//! go through these methods rather than through the stream).

use crate::coordination::circuit_breaker;
use crate::store::event_log;
use crate::store::model::{AgentMetrics, AgentRegistration, RegistrationStatus};
use crate::store::Store;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub const AGENT_ANNOUNCEMENTS_STREAM: &str = "agent-announcements";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Announcement {
    Registration {
        agent_id: String,
        agent_type: String,
        capabilities: Option<Vec<String>>,
        version: Option<String>,
        max_concurrent_tasks: Option<u32>,
        priority: Option<u32>,
        tags: Option<Vec<String>>,
        host: Option<String>,
        port: Option<u16>,
        endpoint: Option<String>,
    },
    Heartbeat {
        agent_id: String,
    },
    Deregistration {
        agent_id: String,
    },
}

pub struct DiscoveryService {
    store: Arc<Store>,
}

impl DiscoveryService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn register(&self, registration: AgentRegistration) -> crate::error::Result<()> {
        let agent_id = registration.id.clone();
        self.store.register_agent(registration).await?;
        self.store
            .events
            .append(
                event_log::AGENT_DISCOVERY_EVENTS,
                json!({
                    "event_type": "agent_registered",
                    "agent_id": agent_id,
                    "timestamp": Utc::now(),
                }),
            )
            .await;
        Ok(())
    }

    pub async fn deregister(&self, agent_id: &str) -> crate::error::Result<()> {
        self.store.deregister_agent(agent_id).await?;
        self.store
            .events
            .append(
                event_log::AGENT_DISCOVERY_EVENTS,
                json!({
                    "event_type": "agent_deregistered",
                    "agent_id": agent_id,
                    "timestamp": Utc::now(),
                }),
            )
            .await;
        Ok(())
    }

    pub async fn heartbeat(&self, agent_id: &str) -> crate::error::Result<()> {
        self.store.touch_agent_heartbeat(agent_id).await
    }

    /// Highest-scoring ACTIVE agent of `agent_type` whose capabilities are a
    /// superset of `required`, whose circuit is not OPEN, and whose id is
    /// not in `exclude`.
    pub async fn find_best(
        &self,
        agent_type: &str,
        required_capabilities: &[String],
        preferred_tags: &[String],
        exclude: &HashSet<String>,
    ) -> Option<AgentRegistration> {
        let candidate_ids = self.store.agents_of_type(agent_type).await;
        let mut best: Option<(f64, AgentRegistration)> = None;

        for id in candidate_ids {
            if exclude.contains(&id) {
                continue;
            }
            let Some(agent) = self.store.get_agent(&id).await else {
                continue;
            };
            if agent.status != RegistrationStatus::Active {
                continue;
            }
            if !required_capabilities
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
            if metrics.status == crate::store::model::AgentHealthStatus::Offline {
                continue;
            }

            let score = self.score(&agent, &metrics, preferred_tags);
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, agent));
            }
        }

        best.map(|(_, agent)| agent)
    }

    /// Every ACTIVE agent matching `agent_type` (when given) and the
    /// required-capability superset, best score first. Used by the
    /// discovery HTTP filter endpoint, which wants a ranked list rather
    /// than `find_best`'s single winner.
    pub async fn list_matching(
        &self,
        agent_type: Option<&str>,
        required_capabilities: &[String],
        preferred_tags: &[String],
    ) -> Vec<AgentRegistration> {
        let candidate_ids = match agent_type {
            Some(t) => self.store.agents_of_type(t).await,
            None => self
                .store
                .all_agents()
                .await
                .into_iter()
                .map(|a| a.id)
                .collect(),
        };

        let mut scored = Vec::new();
        for id in candidate_ids {
            let Some(agent) = self.store.get_agent(&id).await else {
                continue;
            };
            if agent.status != RegistrationStatus::Active {
                continue;
            }
            if !required_capabilities
                .iter()
                .all(|cap| agent.capabilities.contains(cap))
            {
                continue;
            }
            let metrics = self
                .store
                .get_agent_metrics(&id)
                .await
                .unwrap_or_else(|| AgentMetrics::new(id.clone(), agent.max_concurrent_tasks.max(1)));
            let score = self.score(&agent, &metrics, preferred_tags);
            scored.push((score, agent));
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, agent)| agent).collect()
    }

    fn score(
        &self,
        agent: &AgentRegistration,
        metrics: &AgentMetrics,
        preferred_tags: &[String],
    ) -> f64 {
        let priority_score = (1000.0 - agent.priority as f64) / 10.0;
        let health_contribution = metrics.overall_score();
        let load_headroom = 1.0
            - (metrics.current_load as f64 / metrics.max_concurrency.max(1) as f64);
        let tag_overlap = agent
            .tags
            .iter()
            .filter(|t| preferred_tags.contains(t))
            .count() as f64;

        let mut score = priority_score + health_contribution + load_headroom * 20.0 + tag_overlap * 10.0;
        if metrics.status == crate::store::model::AgentHealthStatus::Unhealthy {
            score -= 50.0;
        }
        score
    }

    pub async fn apply_announcement(&self, announcement: Announcement) -> crate::error::Result<()> {
        match announcement {
            Announcement::Registration {
                agent_id,
                agent_type,
                capabilities,
                version,
                max_concurrent_tasks,
                priority,
                tags,
                host,
                port,
                endpoint,
            } => {
                let now = Utc::now();
                self.register(AgentRegistration {
                    id: agent_id,
                    agent_type,
                    capabilities: capabilities.unwrap_or_default().into_iter().collect(),
                    version: version.unwrap_or_else(|| "0.0.0".to_string()),
                    max_concurrent_tasks: max_concurrent_tasks.unwrap_or(1),
                    priority: priority.unwrap_or(50),
                    tags: tags.unwrap_or_default(),
                    host,
                    port,
                    endpoint,
                    status: RegistrationStatus::Active,
                    registered_at: now,
                    last_seen: now,
                })
                .await
            }
            Announcement::Heartbeat { agent_id } => self.heartbeat(&agent_id).await,
            Announcement::Deregistration { agent_id } => self.deregister(&agent_id).await,
        }
    }

    pub async fn scan_loop(
        &self,
        last_seen_stream_id: &mut u64,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                entries = self.store.events.read_from(
                    AGENT_ANNOUNCEMENTS_STREAM,
                    *last_seen_stream_id,
                    100,
                    std::time::Duration::from_secs(5),
                ) => {
                    for entry in entries {
                        *last_seen_stream_id = entry.id;
                        match serde_json::from_value::<Announcement>(entry.fields) {
                            Ok(announcement) => {
                                if let Err(e) = self.apply_announcement(announcement).await {
                                    warn!("failed to apply agent announcement: {}", e);
                                }
                            }
                            Err(e) => warn!("malformed agent announcement: {}", e),
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("discovery scan loop shutting down");
                    break;
                }
            }
        }
    }

    pub async fn cleanup_loop(
        &self,
        agent_timeout: std::time::Duration,
        interval: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cleanup_once(agent_timeout).await,
                _ = shutdown.changed() => {
                    info!("discovery cleanup loop shutting down");
                    break;
                }
            }
        }
    }

    async fn cleanup_once(&self, agent_timeout: std::time::Duration) {
        let timeout = chrono::Duration::from_std(agent_timeout).unwrap_or_default();
        for agent in self.store.all_agents().await {
            if agent.status == RegistrationStatus::Active && Utc::now() - agent.last_seen > timeout {
                if let Err(e) = self.deregister(&agent.id).await {
                    warn!("failed to deregister stale agent {}: {}", agent.id, e);
                }
            }
        }
    }

    pub fn canonical_stream_for(&self, agent_type: &str) -> String {
        super::stream_naming::agent_input_stream(agent_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::RegistrationStatus;

    fn registration(id: &str, caps: &[&str]) -> AgentRegistration {
        let now = Utc::now();
        AgentRegistration {
            id: id.to_string(),
            agent_type: "coding".to_string(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            version: "1.0".to_string(),
            max_concurrent_tasks: 4,
            priority: 10,
            tags: vec![],
            host: None,
            port: None,
            endpoint: None,
            status: RegistrationStatus::Active,
            registered_at: now,
            last_seen: now,
        }
    }

    #[tokio::test]
    async fn find_best_requires_capability_superset() {
        let store = Arc::new(Store::new());
        let discovery = DiscoveryService::new(Arc::clone(&store));
        discovery.register(registration("a1", &["python"])).await.unwrap();
        discovery.register(registration("a2", &["rust", "python"])).await.unwrap();

        let best = discovery
            .find_best("coding", &["rust".to_string()], &[], &Default::default())
            .await
            .unwrap();
        assert_eq!(best.id, "a2");
    }

    #[tokio::test]
    async fn find_best_excludes_requested_ids() {
        let store = Arc::new(Store::new());
        let discovery = DiscoveryService::new(Arc::clone(&store));
        discovery.register(registration("a1", &["rust"])).await.unwrap();

        let exclude: HashSet<String> = ["a1".to_string()].into_iter().collect();
        let best = discovery
            .find_best("coding", &["rust".to_string()], &[], &exclude)
            .await;
        assert!(best.is_none());
    }

    #[tokio::test]
    async fn double_registration_does_not_duplicate_capability_index() {
        let store = Arc::new(Store::new());
        let discovery = DiscoveryService::new(Arc::clone(&store));
        discovery.register(registration("a1", &["rust"])).await.unwrap();
        discovery.register(registration("a1", &["rust"])).await.unwrap();

        assert_eq!(store.agents_with_capability("rust").await.len(), 1);
    }
}
