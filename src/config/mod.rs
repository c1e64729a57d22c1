use crate::constants;
use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub coordination: CoordinationConfig,
    pub tdd: TddConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    pub heartbeat_interval: Duration,
    pub health_check_interval: Duration,
    pub offline_threshold: Duration,
    pub discovery_interval: Duration,
    pub cleanup_interval: Duration,
    pub agent_timeout: Duration,
    pub default_routing_strategy: String,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TddConfig {
    pub max_phase_retries: u32,
    pub max_total_retries: u32,
    pub max_stagnation_retries: u32,
    pub phase_timeout_red: Duration,
    pub phase_timeout_yellow: Duration,
    pub phase_timeout_green: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub bind_address: String,
    pub api_key: Option<String>,
    pub enable_auth: bool,
    pub allowed_origins: Vec<String>,
    pub subscriber_queue_capacity: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let coordination = CoordinationConfig {
            heartbeat_interval: env_duration_secs(
                "HEARTBEAT_INTERVAL_SECS",
                constants::HEARTBEAT_INTERVAL,
            ),
            health_check_interval: env_duration_secs(
                "HEALTH_CHECK_INTERVAL_SECS",
                constants::HEALTH_CHECK_INTERVAL,
            ),
            offline_threshold: env_duration_secs(
                "OFFLINE_THRESHOLD_SECS",
                constants::OFFLINE_THRESHOLD,
            ),
            discovery_interval: env_duration_secs(
                "DISCOVERY_INTERVAL_SECS",
                constants::DISCOVERY_INTERVAL,
            ),
            cleanup_interval: env_duration_secs(
                "CLEANUP_INTERVAL_SECS",
                constants::CLEANUP_INTERVAL,
            ),
            agent_timeout: env_duration_secs("AGENT_TIMEOUT_SECS", constants::AGENT_TIMEOUT),
            default_routing_strategy: env::var("DEFAULT_ROUTING_STRATEGY")
                .unwrap_or_else(|_| "health_aware".to_string()),
            circuit_breaker_threshold: env_parse(
                "CIRCUIT_BREAKER_THRESHOLD",
                constants::CIRCUIT_BREAKER_THRESHOLD,
            ),
            circuit_breaker_timeout: env_duration_secs(
                "CIRCUIT_BREAKER_TIMEOUT_SECS",
                constants::CIRCUIT_BREAKER_TIMEOUT,
            ),
        };

        let tdd = TddConfig {
            max_phase_retries: env_parse("MAX_PHASE_RETRIES", constants::MAX_PHASE_RETRIES),
            max_total_retries: env_parse("MAX_TOTAL_RETRIES", constants::MAX_TOTAL_RETRIES),
            max_stagnation_retries: env_parse(
                "MAX_STAGNATION_RETRIES",
                constants::MAX_STAGNATION_RETRIES,
            ),
            phase_timeout_red: env_duration_secs(
                "PHASE_TIMEOUT_RED_SECS",
                constants::PHASE_TIMEOUT_RED,
            ),
            phase_timeout_yellow: env_duration_secs(
                "PHASE_TIMEOUT_YELLOW_SECS",
                constants::PHASE_TIMEOUT_YELLOW,
            ),
            phase_timeout_green: env_duration_secs(
                "PHASE_TIMEOUT_GREEN_SECS",
                constants::PHASE_TIMEOUT_GREEN,
            ),
        };

        let api_key = env::var("API_KEY").ok().filter(|k| !k.trim().is_empty());
        if let Some(key) = &api_key {
            if key.len() < 32 {
                return Err(OrchestratorError::Config(
                    "API_KEY must be at least 32 characters when set".to_string(),
                ));
            }
        }
        let enable_auth = api_key.is_some();

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| constants::DEFAULT_BIND_ADDRESS.to_string()),
            api_key,
            enable_auth,
            allowed_origins,
            subscriber_queue_capacity: env_parse(
                "SUBSCRIBER_QUEUE_CAPACITY",
                constants::DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            ),
        };

        Ok(Config {
            coordination,
            tdd,
            api,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests;
