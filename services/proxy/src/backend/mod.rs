//! Backend groups, health checks and discovery.
//!
//! - `ServerGroup`: members of one service with selection over the healthy ones
//! - `GroupManager`: one group per service, reconciled from a `Discovery`
//! - `HealthCheckConfig` / `Prober`: per-server active checks

mod discovery;
mod group;
mod health;
mod manager;
mod method;

pub use discovery::{BackendEndpoint, Discovery, HttpDiscovery, StaticDiscovery, MIN_POLL_INTERVAL};
pub use group::{ActiveGuard, ServerGroup, ServerHandle, DEFAULT_WEIGHT};
pub use health::{
    prober_for, CheckProtocol, HealthCheckConfig, HealthStatus, HttpProber, Prober, TcpProber,
};
pub use manager::GroupManager;
pub use method::Method;
