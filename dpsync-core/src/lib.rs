//! dpsync core - declarative reconciliation for a network dataplane agent
//!
//! Configuration objects (Linux routes, dataplane punt rules) are described
//! as key/value pairs.  Each object type is handled by a descriptor that
//! knows how to validate, apply, compare and enumerate it; the engine keeps
//! the system converged on the desired state, ordering operations by their
//! dependencies and retrying what can be retried.
//!
//! # Layout:
//! - [`descriptor`]: descriptor contract, registry and the route/punt
//!   descriptors
//! - [`engine`]: planning, dependency-ordered execution and the agent loop
//! - [`resync`]: full re-discovery with a bounded dump worker pool
//! - [`handle`], [`namespace`], [`ifindex`]: the collaborators descriptors
//!   act through

pub mod addrs;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod handle;
pub mod ifindex;
pub mod model;
pub mod namespace;
pub mod perf;
pub mod resync;

pub use config::{AgentConfig, ConfigError};
pub use descriptor::{
    Dependency, Descriptor, DescriptorRegistry, KeyValue, KvWithMetadata, Origin, PuntDescriptor,
    RouteDescriptor, Value,
};
pub use engine::{Engine, EngineError, KeyState, KeyStatus, ReconcileReport, RetryPolicy};
pub use perf::{SyncMetrics, SyncSnapshot};
pub use resync::{DesiredStateSource, FileSource, ResyncReport, ResyncRequest, UnwantedPolicy};

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber, filtered by `RUST_LOG`
/// (default `info`).  Calling it again is harmless.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("dpsync core v{}", env!("CARGO_PKG_VERSION"));
    }
}
