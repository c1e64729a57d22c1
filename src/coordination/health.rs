//! Agent liveness and health scoring. Scores feed the router's HEALTH_AWARE
//! strategy and `findBest`'s ranking; they are recomputed on a timer and
//! whenever a task starts or completes.

use crate::config::CoordinationConfig;
use crate::store::event_log;
use crate::store::model::{AgentHealthStatus, AgentMetrics, RegistrationStatus};
use crate::store::Store;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

pub struct HealthMonitor {
    store: Arc<Store>,
    config: CoordinationConfig,
}

impl HealthMonitor {
    pub fn new(store: Arc<Store>, config: CoordinationConfig) -> Self {
        Self { store, config }
    }

    pub async fn record_task_start(&self, agent_id: &str, task_id: &str) {
        let _ = self
            .store
            .update_agent_metrics(agent_id, |metrics| {
                metrics.current_load += 1;
                metrics.task_started_at.insert(task_id.to_string(), Utc::now());
            })
            .await;
    }

    pub async fn record_task_completion(&self, agent_id: &str, task_id: &str, success: bool) {
        let _ = self
            .store
            .update_agent_metrics(agent_id, |metrics| {
                metrics.current_load = metrics.current_load.saturating_sub(1);
                metrics.total_tasks += 1;
                if success {
                    metrics.successful_tasks += 1;
                } else {
                    metrics.failed_tasks += 1;
                    metrics.errors_recent += 1;
                    metrics.errors_today += 1;
                }
                if let Some(started) = metrics.task_started_at.remove(task_id) {
                    let elapsed_ms = (Utc::now() - started).num_milliseconds().max(0) as f64;
                    const ALPHA: f64 = 0.1;
                    metrics.avg_response_time_ms =
                        ALPHA * elapsed_ms + (1.0 - ALPHA) * metrics.avg_response_time_ms;
                }
            })
            .await;
        self.recompute_scores(agent_id).await;
    }

    /// One sweep of every registered agent: marks stale ones OFFLINE,
    /// otherwise recomputes sub-scores and the derived status.
    pub async fn run_once(&self) {
        let agents = self.store.all_agents().await;
        for agent in agents {
            if agent.status != RegistrationStatus::Active {
                continue;
            }
            let offline = Utc::now() - agent.last_seen
                > chrono::Duration::from_std(self.config.offline_threshold).unwrap_or_default();
            if offline {
                self.set_status(&agent.id, AgentHealthStatus::Offline).await;
                continue;
            }
            self.recompute_scores(&agent.id).await;
        }
    }

    pub async fn run_loop(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.run_once().await,
                _ = shutdown.changed() => {
                    info!("health monitor loop shutting down");
                    break;
                }
            }
        }
    }

    async fn recompute_scores(&self, agent_id: &str) {
        let Some(agent) = self.store.get_agent(agent_id).await else {
            return;
        };
        if agent.status != RegistrationStatus::Active {
            return;
        }

        let metrics = self.store.get_agent_metrics(agent_id).await.unwrap_or_else(|| {
            AgentMetrics::new(agent_id.to_string(), agent.max_concurrent_tasks.max(1))
        });

        let response_time_score =
            (100.0 - (metrics.avg_response_time_ms / 1000.0 - 1.0).max(0.0) * 10.0).max(0.0);
        let load_score = (100.0
            - (metrics.current_load as f64 / metrics.max_concurrency.max(1) as f64) * 50.0)
            .max(0.0);
        let performance = (response_time_score + load_score) / 2.0;

        let reliability = if metrics.total_tasks == 0 {
            100.0
        } else {
            (metrics.successful_tasks as f64 / metrics.total_tasks as f64) * 100.0
        };

        let since_heartbeat = Utc::now() - agent.last_seen;
        let heartbeat_interval =
            chrono::Duration::from_std(self.config.heartbeat_interval).unwrap_or_default();
        let offline_threshold =
            chrono::Duration::from_std(self.config.offline_threshold).unwrap_or_default();
        let availability = if since_heartbeat <= heartbeat_interval {
            100.0
        } else if since_heartbeat <= heartbeat_interval * 2 {
            75.0
        } else if since_heartbeat <= offline_threshold {
            50.0
        } else {
            0.0
        };

        let overall = 0.4 * performance + 0.4 * reliability + 0.2 * availability;
        let new_status = if overall >= 80.0 {
            AgentHealthStatus::Healthy
        } else if overall >= 60.0 {
            AgentHealthStatus::Degraded
        } else {
            AgentHealthStatus::Unhealthy
        };

        let previous_status = metrics.status;
        self.store
            .update_agent_metrics(agent_id, |m| {
                m.performance_score = performance;
                m.reliability_score = reliability;
                m.availability_score = availability;
                m.status = new_status;
            })
            .await
            .ok();

        if previous_status != new_status {
            self.emit_status_changed(agent_id, previous_status, new_status).await;
        }
    }

    async fn set_status(&self, agent_id: &str, status: AgentHealthStatus) {
        let previous = self
            .store
            .get_agent_metrics(agent_id)
            .await
            .map(|m| m.status)
            .unwrap_or(AgentHealthStatus::Initializing);
        if previous == status {
            return;
        }
        self.store
            .update_agent_metrics(agent_id, |m| m.status = status)
            .await
            .ok();
        self.emit_status_changed(agent_id, previous, status).await;
    }

    async fn emit_status_changed(
        &self,
        agent_id: &str,
        from: AgentHealthStatus,
        to: AgentHealthStatus,
    ) {
        debug!(agent_id, ?from, ?to, "agent health status changed");
        self.store
            .events
            .append(
                event_log::AGENT_HEALTH_EVENTS,
                json!({
                    "event_type": "status_changed",
                    "agent_id": agent_id,
                    "from": format!("{from:?}"),
                    "to": format!("{to:?}"),
                    "timestamp": Utc::now(),
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{AgentRegistration, RegistrationStatus};
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

    async fn active_agent(store: &Store, id: &str) {
        let now = Utc::now();
        store
            .register_agent(AgentRegistration {
                id: id.to_string(),
                agent_type: "coding".to_string(),
                capabilities: Default::default(),
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
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_agent_scores_healthy() {
        let store = Arc::new(Store::new());
        active_agent(&store, "a1").await;
        let monitor = HealthMonitor::new(Arc::clone(&store), config());
        monitor.run_once().await;
        let metrics = store.get_agent_metrics("a1").await.unwrap();
        assert_eq!(metrics.status, AgentHealthStatus::Healthy);
    }

    #[tokio::test]
    async fn task_start_and_completion_update_load_and_counters() {
        let store = Arc::new(Store::new());
        active_agent(&store, "a1").await;
        let monitor = HealthMonitor::new(Arc::clone(&store), config());
        monitor.record_task_start("a1", "t1").await;
        let metrics = store.get_agent_metrics("a1").await.unwrap();
        assert_eq!(metrics.current_load, 1);

        monitor.record_task_completion("a1", "t1", true).await;
        let metrics = store.get_agent_metrics("a1").await.unwrap();
        assert_eq!(metrics.current_load, 0);
        assert_eq!(metrics.total_tasks, 1);
        assert_eq!(metrics.successful_tasks, 1);
    }
}
