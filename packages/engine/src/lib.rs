// packages/engine/src/lib.rs
//! Render Pool Engine Library
//!
//! Runs untrusted GUI snippets inside a pool of pre-warmed containers and
//! returns a screenshot or a classified failure.
//!
//! # Architecture
//!
//! - **runtime**: container runtime boundary (docker CLI), sandboxing, render backends
//! - **pool**: warm container pool with exclusive leases and self-healing
//! - **dispatch**: request validation, render orchestration, result taxonomy
//! - **cache**: fingerprint-keyed result cache with an optional disk tier
//! - **health**: background probing of idle workers
//! - **observability**: tracing and Prometheus metrics
//! - **utils**: configuration and errors

pub mod cache;
pub mod dispatch;
pub mod health;
pub mod observability;
pub mod pool;
pub mod runtime;
pub mod utils;

#[cfg(test)]
mod testing;

pub use cache::{CacheConfig, CacheStats, DiskStore, ResultCache};
pub use dispatch::{RenderDispatcher, RenderRequest, RenderResult, RenderStatus};
pub use health::{HealthConfig, HealthMonitor};
pub use pool::{ContainerPool, PoolConfig, PoolStats, ReleaseOutcome, WorkerLease};
pub use runtime::{ContainerRuntime, DockerRuntime, RenderBackend};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
