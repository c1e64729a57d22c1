//! Per-agent circuit breaker bookkeeping. Unlike the single global breaker a
//! process guards one upstream API with, every agent id here gets its own
//! independent counters over a shared threshold/timeout configuration.

use crate::store::model::{CircuitBreakerState, CircuitState};
use crate::store::Store;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Commits the OPEN -> HALF_OPEN expiry transition (once `open_until` has
/// passed) before checking, so routing never treats a stale OPEN that's
/// actually past its timeout as still open.
pub async fn is_open(store: &Store, agent_id: &str) -> bool {
    effective_state(store, agent_id).await == CircuitState::Open
}

/// Applies the expiry transition (OPEN -> HALF_OPEN once `open_until` has
/// passed) before returning the effective state, so callers never see a
/// stale OPEN that's actually past its timeout.
pub async fn effective_state(store: &Store, agent_id: &str) -> CircuitState {
    store
        .update_circuit_breaker(agent_id, |breaker| {
            if breaker.state == CircuitState::Open {
                if let Some(until) = breaker.open_until {
                    if Utc::now() >= until {
                        breaker.state = CircuitState::HalfOpen;
                        breaker.consecutive_failures = 0;
                    }
                }
            }
        })
        .await
        .state
}

pub async fn record_success(store: &Store, agent_id: &str) -> CircuitBreakerState {
    store
        .update_circuit_breaker(agent_id, |breaker| {
            breaker.consecutive_failures = 0;
            breaker.state = CircuitState::Closed;
            breaker.open_until = None;
        })
        .await
}

pub async fn record_failure(
    store: &Store,
    agent_id: &str,
    threshold: u32,
    timeout: Duration,
) -> CircuitBreakerState {
    store
        .update_circuit_breaker(agent_id, |breaker| {
            breaker.last_failure_at = Some(Utc::now());
            match breaker.state {
                CircuitState::HalfOpen => {
                    breaker.state = CircuitState::Open;
                    breaker.open_until =
                        Some(Utc::now() + ChronoDuration::from_std(timeout).unwrap_or_default());
                }
                _ => {
                    breaker.consecutive_failures += 1;
                    if breaker.consecutive_failures >= threshold {
                        breaker.state = CircuitState::Open;
                        breaker.open_until = Some(
                            Utc::now() + ChronoDuration::from_std(timeout).unwrap_or_default(),
                        );
                    }
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let store = Store::new();
        for _ in 0..2 {
            record_failure(&store, "a1", 3, Duration::from_secs(30)).await;
        }
        assert!(!is_open(&store, "a1").await);
        record_failure(&store, "a1", 3, Duration::from_secs(30)).await;
        assert!(is_open(&store, "a1").await);
    }

    #[tokio::test]
    async fn success_resets_to_closed() {
        let store = Store::new();
        for _ in 0..3 {
            record_failure(&store, "a1", 3, Duration::from_secs(30)).await;
        }
        assert!(is_open(&store, "a1").await);
        record_success(&store, "a1").await;
        assert!(!is_open(&store, "a1").await);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let store = Store::new();
        record_failure(&store, "a1", 1, Duration::from_millis(0)).await;
        let state = effective_state(&store, "a1").await;
        assert_eq!(state, CircuitState::HalfOpen);
        let breaker = record_failure(&store, "a1", 1, Duration::from_secs(30)).await;
        assert_eq!(breaker.state, CircuitState::Open);
    }
}
