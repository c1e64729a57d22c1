//! System-wide tunables. Values here are the documented defaults; `Config`
//! overrides them from the environment.

use std::time::Duration;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const OFFLINE_THRESHOLD: Duration = Duration::from_secs(120);
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(180);

pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
pub const CIRCUIT_BREAKER_TIMEOUT: Duration = Duration::from_secs(60);

pub const MAX_PHASE_RETRIES: u32 = 3;
pub const MAX_TOTAL_RETRIES: u32 = 10;
pub const MAX_STAGNATION_RETRIES: u32 = 2;

pub const PHASE_TIMEOUT_RED: Duration = Duration::from_secs(60);
pub const PHASE_TIMEOUT_YELLOW: Duration = Duration::from_secs(120);
pub const PHASE_TIMEOUT_GREEN: Duration = Duration::from_secs(30);

/// Per-category retry strategy: (max_attempts, delay_seconds).
pub const RETRY_SYNTAX: (u32, u64) = (2, 1);
pub const RETRY_TEST_FAILURE: (u32, u64) = (3, 2);
pub const RETRY_IMPORT: (u32, u64) = (2, 1);

pub const DEFAULT_ROUTER_MAX_RETRIES: u32 = 3;
pub const ROUTER_BACKOFF_CAP_SECS: u64 = 10;
pub const DEFAULT_ROUTER_TIMEOUT: Duration = Duration::from_secs(30);

pub const MAX_USER_REQUEST_LENGTH: usize = 10_000;
pub const MAX_TAG_LENGTH: usize = 100;

pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

pub const REQUESTS_PER_MINUTE: u32 = 60;
pub const JOB_SUBMIT_REQUESTS_PER_MINUTE: u32 = 10;
