// packages/engine/src/utils/errors.rs
//! Engine error type
//!
//! Per-request failures never leave the dispatcher as `Err`; they are folded
//! into a `RenderResult` status. The variants here cover pool construction,
//! the container runtime boundary, storage, and setup.

use thiserror::Error;

/// Errors produced by the render engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// No idle worker became available before the acquire timeout
    #[error("container pool exhausted")]
    PoolExhausted,

    /// The pool stopped issuing leases
    #[error("container pool is shutting down")]
    PoolShuttingDown,

    /// The container runtime itself failed (create/start/exec/kill/destroy)
    #[error("container runtime failure: {0}")]
    Infra(String),

    /// An execution exceeded its deadline
    #[error("execution timed out")]
    ExecutionTimeout,

    /// A worker could not be brought to Idle
    #[error("worker warm-up failed: {0}")]
    WarmupFailed(String),

    /// The minimum warm pool could not be established at startup
    #[error("pool initialization failed: {0}")]
    PoolInitFailed(String),

    #[error("cache storage failed: {0}")]
    StorageFailed(String),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("observability setup failed: {0}")]
    Observability(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error came from the container infrastructure rather than
    /// from the submitted code
    pub fn is_infra(&self) -> bool {
        matches!(
            self,
            EngineError::Infra(_) | EngineError::WarmupFailed(_) | EngineError::Io(_)
        )
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

/// Engine result alias
pub type Result<T> = std::result::Result<T, EngineError>;
