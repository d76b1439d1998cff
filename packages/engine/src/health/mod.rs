// packages/engine/src/health/mod.rs
//! Background health checking of idle workers

pub mod monitor;

pub use monitor::{HealthConfig, HealthMonitor, HealthReport};
