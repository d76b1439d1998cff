// packages/engine/src/pool/worker.rs
//! Worker handles
//!
//! A worker is one addressable container plus its lifecycle state. Handles
//! live inside the pool's state table; everything outside the pool sees
//! [`WorkerSnapshot`] copies or holds a lease.
//!
//! ```text
//! Cold ──► Warming ──► Idle ◄──► Busy
//!   ▲                   │          │
//!   │                   ▼          ▼
//!   └── Terminating ◄── Unhealthy ◄┘
//! ```

use crate::runtime::container::ContainerId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use ulid::Ulid;

/// Stable identity of a worker slot, kept across replacements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(Ulid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No container yet
    Cold,
    /// Container being created, started and probed
    Warming,
    /// Ready for a lease
    Idle,
    /// Leased to a render or a health probe
    Busy,
    /// Failed too often or failed a probe; awaiting replacement
    Unhealthy,
    /// Container being destroyed
    Terminating,
}

impl WorkerState {
    pub const ALL: [WorkerState; 6] = [
        WorkerState::Cold,
        WorkerState::Warming,
        WorkerState::Idle,
        WorkerState::Busy,
        WorkerState::Unhealthy,
        WorkerState::Terminating,
    ];

    /// States reported by `PoolStats::capacity_in_use`
    pub fn counts_toward_capacity(self) -> bool {
        matches!(
            self,
            WorkerState::Idle | WorkerState::Busy | WorkerState::Warming
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Cold => "cold",
            WorkerState::Warming => "warming",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Unhealthy => "unhealthy",
            WorkerState::Terminating => "terminating",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a Busy worker is leased for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseKind {
    Render,
    Probe,
}

/// One worker's mutable record, owned by the pool
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    pub id: WorkerId,
    pub container: Option<ContainerId>,
    pub state: WorkerState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Number of times the container behind this slot was replaced
    pub generation: u32,
    pub lease: Option<LeaseKind>,
}

impl WorkerHandle {
    pub fn new() -> Self {
        Self {
            id: WorkerId::new(),
            container: None,
            state: WorkerState::Cold,
            created_at: Utc::now(),
            last_used_at: None,
            consecutive_failures: 0,
            generation: 0,
            lease: None,
        }
    }

    /// Reset for a fresh container in the same slot
    pub fn recycle(&mut self) {
        self.container = None;
        self.state = WorkerState::Cold;
        self.created_at = Utc::now();
        self.last_used_at = None;
        self.consecutive_failures = 0;
        self.generation += 1;
        self.lease = None;
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            container: self.container.as_ref().map(ToString::to_string),
            state: self.state,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            consecutive_failures: self.consecutive_failures,
            generation: self.generation,
            lease: self.lease,
        }
    }
}

/// Read-only copy of a worker's record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    /// Short container id, if one exists
    pub container: Option<String>,
    pub state: WorkerState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub generation: u32,
    pub lease: Option<LeaseKind>,
}
