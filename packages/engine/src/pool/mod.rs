// packages/engine/src/pool/mod.rs
//! Container pool
//!
//! - **Worker**: one container slot and its lifecycle state
//! - **Container Pool**: pre-warming, leasing, growth, replacement, shutdown
//! - **Lease**: exclusive, self-releasing access to one worker

pub mod container_pool;
pub mod lease;
pub mod worker;

pub use container_pool::{ContainerPool, PoolConfig, PoolStats, ReleaseOutcome};
pub use lease::WorkerLease;
pub use worker::{LeaseKind, WorkerId, WorkerSnapshot, WorkerState};
