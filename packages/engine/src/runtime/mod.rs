// packages/engine/src/runtime/mod.rs
//! Container execution runtime
//!
//! This module provides everything below the pool:
//!
//! - **Container**: the `ContainerRuntime` boundary the pool talks through
//! - **Docker**: the docker CLI implementation of that boundary
//! - **Process Manager**: spawning and bounding CLI invocations
//! - **Sandbox**: isolation flags and pool labels for worker containers
//! - **Resource Limiter**: memory, CPU and ulimit ceilings
//! - **Backend**: how a snippet becomes an execution and an image
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Container Pool                      │
//! └──────────────┬──────────────────────────┬───────────────┘
//!                │ ExecPayload              │ ExecOutput
//!                ▼                          │
//! ┌──────────────────────────┐   ┌──────────┴──────────────┐
//! │      RenderBackend       │   │    ContainerRuntime     │
//! │ (entrypoint / template)  │   │  (docker CLI, fakes)    │
//! └──────────────────────────┘   └──────────┬──────────────┘
//!                                           │
//!                              ┌────────────┴────────────┐
//!                              │ Sandbox + ResourceLimits│
//!                              │  --network none, tmpfs, │
//!                              │  --memory, --cpus, ...  │
//!                              └─────────────────────────┘
//! ```

pub mod backend;
pub mod container;
pub mod docker;
pub mod process_manager;
pub mod resource_limiter;
pub mod sandbox;

// Re-export commonly used types
pub use backend::{
    BackendConfig, EntrypointBackend, RenderBackend, RenderJob, RenderOutput, TemplateBackend,
};
pub use container::{ContainerId, ContainerRuntime, ExecOutput, ExecPayload};
pub use docker::DockerRuntime;
pub use process_manager::{CommandOutput, ProcessManager};
pub use resource_limiter::ResourceLimits;
pub use sandbox::SandboxConfig;
