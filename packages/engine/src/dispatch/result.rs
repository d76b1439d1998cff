// packages/engine/src/dispatch/result.rs
//! Render results

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Outcome class of a render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    /// An image was produced
    Success,
    /// The snippet ran past its deadline
    Timeout,
    /// The validator refused the snippet
    ValidationRejected,
    /// The snippet raised, or produced no usable image
    RuntimeError,
    /// No worker became available in time
    PoolExhausted,
    /// The container runtime failed, including after retry
    InfraFailure,
}

impl RenderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderStatus::Success => "success",
            RenderStatus::Timeout => "timeout",
            RenderStatus::ValidationRejected => "validation_rejected",
            RenderStatus::RuntimeError => "runtime_error",
            RenderStatus::PoolExhausted => "pool_exhausted",
            RenderStatus::InfraFailure => "infra_failure",
        }
    }
}

impl fmt::Display for RenderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one `submit`
#[derive(Debug, Clone, PartialEq)]
pub struct RenderResult {
    pub status: RenderStatus,
    pub image_bytes: Option<Bytes>,
    pub error_detail: Option<String>,
    /// Wall time from submit to result (for cache hits, of the original render)
    pub duration: Duration,
}

impl RenderResult {
    pub fn success(image: Bytes, duration: Duration) -> Self {
        Self {
            status: RenderStatus::Success,
            image_bytes: Some(image),
            error_detail: None,
            duration,
        }
    }

    pub fn failure(status: RenderStatus, detail: impl Into<String>, duration: Duration) -> Self {
        Self {
            status,
            image_bytes: None,
            error_detail: Some(detail.into()),
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RenderStatus::Success
    }

    /// Bytes this result occupies as payload
    pub fn size_bytes(&self) -> usize {
        self.image_bytes.as_ref().map_or(0, Bytes::len)
            + self.error_detail.as_ref().map_or(0, String::len)
    }
}
