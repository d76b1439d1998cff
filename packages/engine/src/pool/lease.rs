// packages/engine/src/pool/lease.rs
//! Exclusive use of one worker
//!
//! A lease is the only way to reach a worker's container from outside the
//! pool. It is not `Clone`; whoever holds it is the only one executing in
//! that container. Dropping a lease without releasing it counts as a failed
//! lease, so a cancelled render can never strand a Busy worker.

use crate::pool::container_pool::{ContainerPool, ReleaseOutcome};
use crate::pool::worker::{LeaseKind, WorkerId};
use crate::runtime::backend::{RenderJob, RenderOutput};
use crate::runtime::container::ContainerId;
use crate::utils::errors::Result;
use std::time::Duration;
use tracing::{debug, warn};

/// Exclusive lease on a Busy worker
pub struct WorkerLease {
    pool: ContainerPool,
    worker_id: WorkerId,
    container: ContainerId,
    kind: LeaseKind,
    released: bool,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker_id", &self.worker_id)
            .field("container", &self.container)
            .field("kind", &self.kind)
            .finish()
    }
}

impl WorkerLease {
    pub(crate) fn new(
        pool: ContainerPool,
        worker_id: WorkerId,
        container: ContainerId,
        kind: LeaseKind,
    ) -> Self {
        Self {
            pool,
            worker_id,
            container,
            kind,
            released: false,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn container(&self) -> &ContainerId {
        &self.container
    }

    pub fn kind(&self) -> LeaseKind {
        self.kind
    }

    pub(crate) fn belongs_to(&self, pool: &ContainerPool) -> bool {
        self.pool.same_pool(pool)
    }

    /// Run one render in the leased container
    ///
    /// `Err` means the runtime failed; a snippet that raised is
    /// `Ok(RenderOutput::Error)`.
    pub async fn execute(&self, job: &RenderJob<'_>) -> Result<RenderOutput> {
        let backend = self.pool.backend();
        let payload = backend.render_payload(job);

        debug!(
            "Executing render on worker {} ({} bytes, {})",
            self.worker_id,
            job.source.len(),
            job.display
        );

        let output = self
            .pool
            .runtime()
            .exec(&self.container, &payload, job.deadline)
            .await?;
        Ok(backend.interpret(output))
    }

    /// Run the backend's liveness check, bounded by `timeout`
    pub async fn probe(&self, timeout: Duration) -> bool {
        let backend = self.pool.backend();
        let payload = backend.probe_payload();
        let exec = self.pool.runtime().exec(&self.container, &payload, timeout);

        match tokio::time::timeout(timeout, exec).await {
            Ok(Ok(output)) => backend.probe_ok(&output),
            Ok(Err(e)) => {
                debug!("Probe on worker {} errored: {}", self.worker_id, e);
                false
            }
            Err(_) => {
                debug!("Probe on worker {} timed out", self.worker_id);
                false
            }
        }
    }

    /// Terminate whatever is running in the container, keeping the container
    pub async fn kill(&self) -> Result<()> {
        self.pool.runtime().kill(&self.container).await
    }

    /// Hand the worker back to the pool
    pub fn release(mut self, outcome: ReleaseOutcome) {
        self.released = true;
        match self.kind {
            LeaseKind::Render => self.pool.finish_lease(self.worker_id, outcome),
            LeaseKind::Probe => self
                .pool
                .finish_probe(self.worker_id, outcome == ReleaseOutcome::Healthy),
        }
    }

    /// Hand a probed worker back, replacing it if the probe failed
    pub fn finish_probe(self, healthy: bool) {
        let outcome = if healthy {
            ReleaseOutcome::Healthy
        } else {
            ReleaseOutcome::Broken
        };
        self.release(outcome);
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!(
            "Lease on worker {} dropped without release; counting it as failed",
            self.worker_id
        );
        match self.kind {
            LeaseKind::Render => self
                .pool
                .finish_lease(self.worker_id, ReleaseOutcome::Failed),
            LeaseKind::Probe => self.pool.finish_probe(self.worker_id, false),
        }
    }
}
