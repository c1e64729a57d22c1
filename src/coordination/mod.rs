//! Agent liveness, discovery, routing, and per-agent circuit breaking. The
//! four submodules share the state store as their only synchronization
//! point; none of them hold locks across an await on another.

pub mod circuit_breaker;
pub mod discovery;
pub mod health;
pub mod router;
pub mod stream_naming;

pub use discovery::{Announcement, DiscoveryService};
pub use health::HealthMonitor;
pub use router::{RouteRequest, RouteResult, Router, RoutingStrategy};
