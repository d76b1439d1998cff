// packages/engine/src/pool/container_pool.rs
//! Container pool with pre-warming and replacement
//!
//! The pool keeps `min_warm` containers warm so renders never pay container
//! start-up latency, grows toward `max_total` when callers are waiting, and
//! replaces workers that keep failing.
//!
//! # Architecture
//!
//! ```text
//! ContainerPool
//! ├─ Workers: {id → WorkerHandle}     (every slot, any state)
//! ├─ Idle:    [W1, W4, ...]            (FIFO of leasable workers)
//! ├─ Waiters: n                        (callers blocked in acquire)
//! └─ Tasks:   warm-up / replacement / retirement (spawned, never hold the lock)
//! ```
//!
//! All state transitions happen under one short `parking_lot` lock that is
//! never held across an await. Executing inside a leased worker holds no pool
//! lock at all. Every transition that can satisfy a waiter wakes all waiters
//! through a `Notify`; waiters re-check state under the lock.
//!
//! # Capacity
//!
//! A slot is only ever added while the number of slots is below `max_total`,
//! and replacement reuses the slot it replaces, so Idle + Busy + Warming can
//! never exceed `max_total`.

use crate::observability;
use crate::pool::lease::WorkerLease;
use crate::pool::worker::{LeaseKind, WorkerHandle, WorkerId, WorkerSnapshot, WorkerState};
use crate::runtime::backend::RenderBackend;
use crate::runtime::container::{ContainerId, ContainerRuntime};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for the container pool
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Workers brought up before `initialize` returns (default: 2)
    pub min_warm: usize,

    /// Upper bound on Idle + Busy + Warming workers (default: 5)
    pub max_total: usize,

    /// Consecutive failed leases before a worker is replaced (default: 3)
    pub failure_threshold: u32,

    /// Budget for create + start + readiness (default: 30s)
    pub warmup_timeout: Duration,

    /// Pause between readiness probes during warm-up (default: 500ms)
    pub warmup_probe_interval: Duration,

    /// Container name prefix
    pub name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_warm: 2,
            max_total: 5,
            failure_threshold: 3,
            warmup_timeout: Duration::from_secs(30),
            warmup_probe_interval: Duration::from_millis(500),
            name_prefix: "renderpool-worker".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_total == 0 {
            return Err("max_total must be at least 1".to_string());
        }
        if self.min_warm > self.max_total {
            return Err(format!(
                "min_warm ({}) cannot exceed max_total ({})",
                self.min_warm, self.max_total
            ));
        }
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if self.warmup_timeout.is_zero() {
            return Err("warmup_timeout must be non-zero".to_string());
        }
        if self.name_prefix.trim().is_empty() {
            return Err("name_prefix cannot be empty".to_string());
        }
        Ok(())
    }
}

/// How a lease ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The worker behaved; back to Idle with a clean record
    Healthy,

    /// One strike; replaced once strikes reach the failure threshold
    Failed,

    /// The container itself is not trustworthy; replace now
    Broken,
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub cold: usize,
    pub warming: usize,
    pub idle: usize,
    pub busy: usize,
    pub unhealthy: usize,
    pub terminating: usize,
    pub waiters: usize,
    pub max_total: usize,
    /// Render leases handed out since start
    pub leases_granted: u64,
    pub shutting_down: bool,
}

impl PoolStats {
    /// Workers in a given state
    pub fn count(&self, state: WorkerState) -> usize {
        match state {
            WorkerState::Cold => self.cold,
            WorkerState::Warming => self.warming,
            WorkerState::Idle => self.idle,
            WorkerState::Busy => self.busy,
            WorkerState::Unhealthy => self.unhealthy,
            WorkerState::Terminating => self.terminating,
        }
    }

    /// Workers in states bounded by `max_total`
    pub fn capacity_in_use(&self) -> usize {
        WorkerState::ALL
            .into_iter()
            .filter(|s| s.counts_toward_capacity())
            .map(|s| self.count(s))
            .sum()
    }
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerId, WorkerHandle>,
    idle: VecDeque<WorkerId>,
    waiters: usize,
    leases_granted: u64,
    terminating: bool,
}

impl PoolState {
    fn count(&self, state: WorkerState) -> usize {
        self.workers.values().filter(|w| w.state == state).count()
    }

    fn pending(&self) -> usize {
        self.count(WorkerState::Cold) + self.count(WorkerState::Warming)
    }

    fn make_idle(&mut self, id: WorkerId) {
        if let Some(handle) = self.workers.get_mut(&id) {
            handle.state = WorkerState::Idle;
            handle.lease = None;
            self.idle.push_back(id);
        }
    }

    fn take_idle(&mut self, id: WorkerId) -> bool {
        match self.idle.iter().position(|candidate| *candidate == id) {
            Some(pos) => {
                self.idle.remove(pos);
                true
            }
            None => false,
        }
    }

    fn stats(&self, max_total: usize) -> PoolStats {
        PoolStats {
            total: self.workers.len(),
            cold: self.count(WorkerState::Cold),
            warming: self.count(WorkerState::Warming),
            idle: self.count(WorkerState::Idle),
            busy: self.count(WorkerState::Busy),
            unhealthy: self.count(WorkerState::Unhealthy),
            terminating: self.count(WorkerState::Terminating),
            waiters: self.waiters,
            max_total,
            leases_granted: self.leases_granted,
            shutting_down: self.terminating,
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    runtime: Arc<dyn ContainerRuntime>,
    backend: Arc<dyn RenderBackend>,
    state: Mutex<PoolState>,
    changed: Notify,
    tasks: Handle,
}

/// Pool of pre-warmed render containers
#[derive(Clone)]
pub struct ContainerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ContainerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerPool")
            .field("runtime", &self.inner.runtime.name())
            .field("backend", &self.inner.backend.name())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Keeps the waiter count honest even if `acquire` is cancelled
struct WaiterGuard<'a> {
    inner: &'a PoolInner,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.waiters = state.waiters.saturating_sub(1);
    }
}

impl ContainerPool {
    /// Bring up `min_warm` workers and return a ready pool
    ///
    /// Leftover containers from a previous run are removed first. If any
    /// worker fails to warm, everything created so far is destroyed and
    /// `PoolInitFailed` is returned; there is no degraded start.
    pub async fn initialize(
        config: PoolConfig,
        runtime: Arc<dyn ContainerRuntime>,
        backend: Arc<dyn RenderBackend>,
    ) -> Result<Self> {
        config.validate().map_err(EngineError::PoolInitFailed)?;

        info!(
            "Initializing container pool (min_warm={}, max_total={}, runtime={}, backend={})",
            config.min_warm,
            config.max_total,
            runtime.name(),
            backend.name()
        );

        match runtime.reap_orphans().await {
            Ok(0) => {}
            Ok(n) => info!("Removed {} leftover containers", n),
            Err(e) => warn!("Failed to reap leftover containers: {}", e),
        }

        let min_warm = config.min_warm;
        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                runtime,
                backend,
                state: Mutex::new(PoolState::default()),
                changed: Notify::new(),
                tasks: Handle::current(),
            }),
        };

        let ids: Vec<WorkerId> = {
            let mut state = pool.inner.state.lock();
            (0..min_warm)
                .map(|_| {
                    let handle = WorkerHandle::new();
                    let id = handle.id;
                    state.workers.insert(id, handle);
                    id
                })
                .collect()
        };

        let results = futures::future::join_all(ids.iter().map(|id| pool.warm(*id))).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err())
            .map(|e| e.to_string())
            .collect();

        if !failures.is_empty() {
            error!(
                "{} of {} workers failed to warm; tearing down",
                failures.len(),
                min_warm
            );
            pool.shutdown().await;
            return Err(EngineError::PoolInitFailed(failures.join("; ")));
        }

        pool.publish_gauges();
        info!("Container pool ready with {} warm workers", min_warm);
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease an Idle worker, waiting up to `timeout` for one
    ///
    /// While waiting, the pool grows in the background if it has room and
    /// not enough workers are already warming for the waiting callers.
    pub async fn acquire(&self, timeout: Duration) -> Result<WorkerLease> {
        let deadline = Instant::now() + timeout;
        let mut waiting: Option<WaiterGuard<'_>> = None;

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let acquired = {
                let mut state = self.inner.state.lock();
                if state.terminating {
                    return Err(EngineError::PoolShuttingDown);
                }

                let mut acquired = None;
                while let Some(id) = state.idle.pop_front() {
                    let Some(handle) = state.workers.get_mut(&id) else {
                        continue;
                    };
                    if handle.state != WorkerState::Idle {
                        continue;
                    }
                    let Some(container) = handle.container.clone() else {
                        continue;
                    };
                    handle.state = WorkerState::Busy;
                    handle.lease = Some(LeaseKind::Render);
                    acquired = Some((id, container));
                    break;
                }
                if acquired.is_some() {
                    state.leases_granted += 1;
                }

                if acquired.is_none() {
                    if waiting.is_none() {
                        state.waiters += 1;
                        waiting = Some(WaiterGuard { inner: &self.inner });
                    }
                    self.grow_if_needed(&mut state);
                }
                acquired
            };

            if let Some((id, container)) = acquired {
                debug!("Acquired worker {} (container {})", id, container);
                self.publish_gauges();
                return Ok(WorkerLease::new(self.clone(), id, container, LeaseKind::Render));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!("No worker became idle within {:?}", timeout);
                return Err(EngineError::PoolExhausted);
            }
        }
    }

    /// Return a lease to the pool
    pub fn release(&self, lease: WorkerLease, outcome: ReleaseOutcome) {
        debug_assert!(lease.belongs_to(self));
        lease.release(outcome);
    }

    /// Ids of workers that are Idle right now
    pub fn idle_workers(&self) -> Vec<WorkerId> {
        self.inner.state.lock().idle.iter().copied().collect()
    }

    /// Take an Idle worker out of rotation for a health probe
    ///
    /// Returns `None` if the worker is no longer Idle (leased, replaced or
    /// shutting down) by the time the probe gets to it.
    pub fn checkout_for_probe(&self, id: WorkerId) -> Option<WorkerLease> {
        let container = {
            let mut state = self.inner.state.lock();
            if state.terminating || !state.take_idle(id) {
                return None;
            }
            let handle = state.workers.get_mut(&id)?;
            handle.state = WorkerState::Busy;
            handle.lease = Some(LeaseKind::Probe);
            handle.container.clone()
        };

        match container {
            Some(container) => Some(WorkerLease::new(self.clone(), id, container, LeaseKind::Probe)),
            None => {
                // An Idle worker without a container is broken; replace it
                self.finish_probe(id, false);
                None
            }
        }
    }

    /// Add workers until `min_warm` slots exist again; returns how many
    pub fn top_up(&self) -> usize {
        let mut state = self.inner.state.lock();
        if state.terminating {
            return 0;
        }

        let missing = self
            .inner
            .config
            .min_warm
            .saturating_sub(state.workers.len());
        for _ in 0..missing {
            self.spawn_worker(&mut state);
        }

        if missing > 0 {
            info!("Topping up pool with {} workers", missing);
        }
        missing
    }

    /// Stop leasing and destroy every worker
    ///
    /// Idle workers are destroyed immediately. Busy workers are destroyed
    /// when their lease ends, warming ones when warm-up finishes. Returns
    /// once no workers remain.
    pub async fn shutdown(&self) {
        let idle: Vec<(WorkerId, Option<ContainerId>)> = {
            let mut state = self.inner.state.lock();
            if !state.terminating {
                info!("Shutting down container pool");
            }
            state.terminating = true;

            let ids: Vec<WorkerId> = state.idle.drain(..).collect();
            let mut idle = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(handle) = state.workers.get_mut(&id) {
                    handle.state = WorkerState::Terminating;
                    idle.push((id, handle.container.take()));
                }
            }

            // Cold slots have no task attached once shutdown begins
            let cold: Vec<WorkerId> = state
                .workers
                .values()
                .filter(|w| w.state == WorkerState::Cold && w.container.is_none())
                .map(|w| w.id)
                .collect();
            for id in cold {
                state.workers.remove(&id);
            }
            idle
        };
        self.inner.changed.notify_waiters();

        futures::future::join_all(idle.into_iter().map(|(id, container)| async move {
            if let Some(container) = container {
                if let Err(e) = self.inner.runtime.destroy(&container).await {
                    warn!("Failed to destroy container {}: {}", container, e);
                }
            }
            self.inner.state.lock().workers.remove(&id);
        }))
        .await;
        self.inner.changed.notify_waiters();

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = self.inner.state.lock().workers.len();
            if remaining == 0 {
                break;
            }
            debug!("Waiting for {} workers to finish before shutdown", remaining);
            notified.await;
        }

        self.publish_gauges();
        info!("Container pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.state.lock().stats(self.inner.config.max_total)
    }

    /// Read-only copies of every worker
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let state = self.inner.state.lock();
        let mut workers: Vec<WorkerSnapshot> =
            state.workers.values().map(WorkerHandle::snapshot).collect();
        workers.sort_by_key(|w| w.created_at);
        workers
    }

    pub fn worker(&self, id: WorkerId) -> Option<WorkerSnapshot> {
        self.inner
            .state
            .lock()
            .workers
            .get(&id)
            .map(WorkerHandle::snapshot)
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.inner.runtime
    }

    pub(crate) fn backend(&self) -> &Arc<dyn RenderBackend> {
        &self.inner.backend
    }

    pub(crate) fn same_pool(&self, other: &ContainerPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// End a render lease
    pub(crate) fn finish_lease(&self, id: WorkerId, outcome: ReleaseOutcome) {
        let mut replace = false;
        let mut retire = false;
        {
            let mut state = self.inner.state.lock();
            let terminating = state.terminating;
            let threshold = self.inner.config.failure_threshold;

            let Some(handle) = state.workers.get_mut(&id) else {
                warn!("Released unknown worker {}", id);
                return;
            };
            if handle.state != WorkerState::Busy {
                warn!("Released worker {} in state {}", id, handle.state);
                return;
            }

            handle.lease = None;
            handle.last_used_at = Some(Utc::now());

            if terminating {
                handle.state = WorkerState::Terminating;
                retire = true;
            } else {
                match outcome {
                    ReleaseOutcome::Healthy => {
                        handle.consecutive_failures = 0;
                    }
                    ReleaseOutcome::Failed => {
                        handle.consecutive_failures += 1;
                        replace = handle.consecutive_failures >= threshold;
                    }
                    ReleaseOutcome::Broken => {
                        handle.consecutive_failures += 1;
                        replace = true;
                    }
                }

                if replace {
                    warn!(
                        worker = %id,
                        failures = handle.consecutive_failures,
                        "Worker marked unhealthy"
                    );
                    handle.state = WorkerState::Unhealthy;
                } else {
                    debug!("Released worker {} ({:?})", id, outcome);
                    state.make_idle(id);
                }
            }
        }

        if replace {
            self.spawn_replacement(id);
        } else if retire {
            self.spawn_retirement(id);
        }
        self.publish_gauges();
        self.inner.changed.notify_waiters();
    }

    /// End a probe lease
    pub(crate) fn finish_probe(&self, id: WorkerId, healthy: bool) {
        let mut replace = false;
        let mut retire = false;
        {
            let mut state = self.inner.state.lock();
            let terminating = state.terminating;
            let Some(handle) = state.workers.get_mut(&id) else {
                return;
            };
            if handle.state != WorkerState::Busy || handle.lease != Some(LeaseKind::Probe) {
                warn!("Probe finished for worker {} in state {}", id, handle.state);
                return;
            }
            handle.lease = None;

            if terminating {
                handle.state = WorkerState::Terminating;
                retire = true;
            } else if healthy {
                state.make_idle(id);
            } else {
                warn!(worker = %id, "Worker failed health probe");
                handle.state = WorkerState::Unhealthy;
                replace = true;
            }
        }

        if replace {
            self.spawn_replacement(id);
        } else if retire {
            self.spawn_retirement(id);
        }
        self.publish_gauges();
        self.inner.changed.notify_waiters();
    }

    fn grow_if_needed(&self, state: &mut PoolState) {
        let room = state.workers.len() < self.inner.config.max_total;
        if room && state.pending() < state.waiters {
            debug!(
                "Growing pool: {} workers, {} waiting",
                state.workers.len(),
                state.waiters
            );
            self.spawn_worker(state);
        }
    }

    /// Add a Cold slot and warm it in the background
    fn spawn_worker(&self, state: &mut PoolState) {
        let handle = WorkerHandle::new();
        let id = handle.id;
        state.workers.insert(id, handle);

        let pool = self.clone();
        self.inner.tasks.spawn(async move {
            if let Err(e) = pool.warm(id).await {
                warn!("Background warm-up of worker {} failed: {}", id, e);
            }
        });
    }

    fn spawn_replacement(&self, id: WorkerId) {
        let pool = self.clone();
        self.inner.tasks.spawn(async move {
            pool.replace(id).await;
        });
    }

    fn spawn_retirement(&self, id: WorkerId) {
        let pool = self.clone();
        self.inner.tasks.spawn(async move {
            pool.retire(id).await;
        });
    }

    /// Unhealthy → Terminating → Cold → Warming → Idle, keeping the slot
    async fn replace(&self, id: WorkerId) {
        let container = {
            let mut state = self.inner.state.lock();
            let Some(handle) = state.workers.get_mut(&id) else {
                return;
            };
            handle.state = WorkerState::Terminating;
            handle.container.take()
        };
        self.publish_gauges();

        if let Some(container) = container {
            if let Err(e) = self.inner.runtime.destroy(&container).await {
                warn!("Failed to destroy container {} of worker {}: {}", container, id, e);
            }
        }

        {
            let mut state = self.inner.state.lock();
            if state.terminating {
                state.workers.remove(&id);
                drop(state);
                self.publish_gauges();
                self.inner.changed.notify_waiters();
                return;
            }
            if let Some(handle) = state.workers.get_mut(&id) {
                handle.recycle();
            }
        }

        metrics::counter!(observability::WORKER_REPLACEMENTS).increment(1);

        match self.warm(id).await {
            Ok(()) => info!("Replaced worker {}", id),
            Err(e) => warn!("Replacement of worker {} failed, slot freed: {}", id, e),
        }
    }

    /// Destroy a worker's container and drop its slot
    async fn retire(&self, id: WorkerId) {
        let container = {
            let mut state = self.inner.state.lock();
            match state.workers.get_mut(&id) {
                Some(handle) => {
                    handle.state = WorkerState::Terminating;
                    handle.container.take()
                }
                None => return,
            }
        };

        if let Some(container) = container {
            if let Err(e) = self.inner.runtime.destroy(&container).await {
                warn!("Failed to destroy container {}: {}", container, e);
            }
        }

        self.inner.state.lock().workers.remove(&id);
        self.publish_gauges();
        self.inner.changed.notify_waiters();
    }

    /// Cold → Warming → Idle
    ///
    /// On failure the container (if any) is destroyed and the slot removed.
    async fn warm(&self, id: WorkerId) -> Result<()> {
        let name = {
            let mut state = self.inner.state.lock();
            let Some(handle) = state.workers.get_mut(&id) else {
                return Err(EngineError::WarmupFailed(format!("worker {} vanished", id)));
            };
            handle.state = WorkerState::Warming;
            format!(
                "{}-{}-{}",
                self.inner.config.name_prefix,
                id.to_string().to_lowercase(),
                handle.generation
            )
        };
        self.publish_gauges();

        let timeout = self.inner.config.warmup_timeout;
        let result = match tokio::time::timeout(timeout, self.bring_up(id, &name)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::WarmupFailed(format!(
                "{} not ready within {:?}",
                name, timeout
            ))),
        };

        match result {
            Ok(()) => {
                let retire = {
                    let mut state = self.inner.state.lock();
                    if state.terminating {
                        true
                    } else {
                        state.make_idle(id);
                        false
                    }
                };

                if retire {
                    self.retire(id).await;
                } else {
                    debug!("Worker {} is warm ({})", id, name);
                    self.publish_gauges();
                    self.inner.changed.notify_waiters();
                }
                Ok(())
            }
            Err(e) => {
                let container = {
                    let mut state = self.inner.state.lock();
                    state
                        .workers
                        .get_mut(&id)
                        .and_then(|handle| handle.container.take())
                };
                if let Some(container) = container {
                    if let Err(destroy_err) = self.inner.runtime.destroy(&container).await {
                        warn!("Failed to destroy container {}: {}", container, destroy_err);
                    }
                }

                self.inner.state.lock().workers.remove(&id);
                self.publish_gauges();
                self.inner.changed.notify_waiters();

                Err(match e {
                    EngineError::WarmupFailed(_) => e,
                    other => EngineError::WarmupFailed(format!("{}: {}", name, other)),
                })
            }
        }
    }

    async fn bring_up(&self, id: WorkerId, name: &str) -> Result<()> {
        let runtime = &self.inner.runtime;
        let container = runtime.create(name).await?;

        let recorded = {
            let mut state = self.inner.state.lock();
            match state.workers.get_mut(&id) {
                Some(handle) => {
                    handle.container = Some(container.clone());
                    true
                }
                None => false,
            }
        };
        if !recorded {
            runtime.destroy(&container).await?;
            return Err(EngineError::WarmupFailed(format!("worker {} vanished", id)));
        }

        runtime.start(&container).await?;

        let probe = self.inner.backend.probe_payload();
        let interval = self.inner.config.warmup_probe_interval;
        loop {
            match runtime
                .exec(&container, &probe, self.inner.config.warmup_timeout)
                .await
            {
                Ok(output) if self.inner.backend.probe_ok(&output) => return Ok(()),
                Ok(output) => debug!(
                    "Container {} not ready yet (exit {:?})",
                    container, output.exit_code
                ),
                Err(e) => debug!("Readiness probe on {} failed: {}", container, e),
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn publish_gauges(&self) {
        let stats = self.stats();
        for (state, count) in [
            (WorkerState::Cold, stats.cold),
            (WorkerState::Warming, stats.warming),
            (WorkerState::Idle, stats.idle),
            (WorkerState::Busy, stats.busy),
            (WorkerState::Unhealthy, stats.unhealthy),
            (WorkerState::Terminating, stats.terminating),
        ] {
            metrics::gauge!(observability::WORKERS, "state" => state.as_str()).set(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::backend::RenderJob;
    use crate::testing::{self, FakeRuntime};
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    async fn pool(min_warm: usize, max_total: usize) -> (ContainerPool, Arc<FakeRuntime>) {
        let runtime = Arc::new(FakeRuntime::new());
        let pool = ContainerPool::initialize(
            testing::pool_config(min_warm, max_total),
            runtime.clone(),
            testing::backend(),
        )
        .await
        .unwrap();
        (pool, runtime)
    }

    #[test]
    fn test_capacity_excludes_retiring_workers() {
        let stats = PoolStats {
            total: 7,
            cold: 1,
            warming: 1,
            idle: 2,
            busy: 1,
            unhealthy: 1,
            terminating: 1,
            max_total: 8,
            ..Default::default()
        };
        assert_eq!(stats.capacity_in_use(), 4);
        assert_eq!(
            WorkerState::ALL.into_iter().map(|s| stats.count(s)).sum::<usize>(),
            stats.total
        );
    }

    #[tokio::test]
    async fn test_initialize_warms_min_workers() {
        let (pool, runtime) = pool(2, 4).await;
        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.total, 2);
        assert_eq!(runtime.creates.load(Ordering::SeqCst), 2);
        assert_eq!(runtime.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_initialize_reaps_orphans() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.orphans.store(3, Ordering::SeqCst);
        ContainerPool::initialize(testing::pool_config(1, 2), runtime.clone(), testing::backend())
            .await
            .unwrap();
        assert_eq!(runtime.orphans.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_initialize_fails_without_partial_pool() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_create_after(1);

        let result =
            ContainerPool::initialize(testing::pool_config(3, 4), runtime.clone(), testing::backend())
                .await;

        assert!(matches!(result, Err(EngineError::PoolInitFailed(_))));
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_initialize_rejects_bad_config() {
        let result = ContainerPool::initialize(
            testing::pool_config(5, 2),
            Arc::new(FakeRuntime::new()),
            testing::backend(),
        )
        .await;
        assert!(matches!(result, Err(EngineError::PoolInitFailed(_))));
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (pool, _runtime) = pool(2, 2).await;

        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.busy, 1);

        let id = lease.worker_id();
        pool.release(lease, ReleaseOutcome::Healthy);

        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.busy, 0);
        assert!(pool.worker(id).unwrap().last_used_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_at_capacity() {
        let (pool, _runtime) = pool(1, 1).await;
        let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let result = pool.acquire(Duration::from_secs(2)).await;
        assert!(matches!(result, Err(EngineError::PoolExhausted)));
        assert_eq!(pool.stats().total, 1);
        assert_eq!(pool.stats().waiters, 0);
    }

    #[tokio::test]
    async fn test_waiter_woken_by_release() {
        let (pool, _runtime) = pool(1, 1).await;
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let held_id = held.worker_id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };

        testing::eventually(|| pool.stats().waiters == 1).await;
        pool.release(held, ReleaseOutcome::Healthy);

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.worker_id(), held_id);
    }

    #[tokio::test]
    async fn test_concurrent_acquisitions_are_exclusive() {
        let (pool, runtime) = pool(3, 3).await;
        let mut handles = vec![];

        for i in 0..12 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire(Duration::from_secs(10)).await.unwrap();
                let source = format!("frame {}", i);
                let job = RenderJob {
                    source: &source,
                    display: Default::default(),
                    deadline: Duration::from_secs(5),
                };
                lease.execute(&job).await.unwrap();
                pool.release(lease, ReleaseOutcome::Healthy);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(!runtime.overlap_detected());
        assert_eq!(runtime.renders.load(Ordering::SeqCst), 12);
        assert_eq!(pool.stats().idle, 3);
    }

    #[tokio::test]
    async fn test_held_leases_are_distinct() {
        let (pool, _runtime) = pool(2, 4).await;
        let mut leases = vec![];
        for _ in 0..4 {
            leases.push(pool.acquire(Duration::from_secs(5)).await.unwrap());
        }

        let ids: HashSet<_> = leases.iter().map(|l| l.worker_id()).collect();
        assert_eq!(ids.len(), 4);
        assert!(pool.stats().capacity_in_use() <= 4);
    }

    #[tokio::test]
    async fn test_grows_for_third_request() {
        let (pool, runtime) = pool(2, 4).await;
        runtime.set_warm_delay(Duration::from_millis(200));

        let first = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let second = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(first.worker_id(), second.worker_id());

        let third = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };

        testing::eventually(|| pool.stats().warming == 1).await;
        assert_eq!(pool.stats().total, 3);

        let lease = third.await.unwrap().unwrap();
        assert_ne!(lease.worker_id(), first.worker_id());
        assert_ne!(lease.worker_id(), second.worker_id());
        assert_eq!(runtime.creates.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_capacity_invariant_under_load() {
        let (pool, runtime) = pool(1, 3).await;
        runtime.set_warm_delay(Duration::from_millis(20));

        let monitor = {
            let pool = pool.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    assert!(pool.stats().capacity_in_use() <= 3);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let mut handles = vec![];
        for _ in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire(Duration::from_secs(10)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.release(lease, ReleaseOutcome::Healthy);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        monitor.await.unwrap();

        assert!(pool.stats().total <= 3);
    }

    #[tokio::test]
    async fn test_replaced_after_three_failures() {
        let (pool, runtime) = pool(1, 1).await;
        let original = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let id = original.worker_id();
        pool.release(original, ReleaseOutcome::Failed);

        for expected in [1, 2] {
            assert_eq!(pool.worker(id).unwrap().consecutive_failures, expected);
            let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
            assert_eq!(lease.worker_id(), id);
            pool.release(lease, ReleaseOutcome::Failed);
        }

        // Third strike: no longer leasable until replaced
        let state = pool.worker(id).map(|w| w.state);
        assert!(matches!(
            state,
            Some(WorkerState::Unhealthy)
                | Some(WorkerState::Terminating)
                | Some(WorkerState::Cold)
                | Some(WorkerState::Warming)
        ));

        let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let worker = pool.worker(lease.worker_id()).unwrap();
        assert_eq!(worker.generation, 1);
        assert_eq!(worker.consecutive_failures, 0);
        assert_eq!(runtime.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_healthy_release_resets_failures() {
        let (pool, _runtime) = pool(1, 1).await;
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let id = lease.worker_id();
        pool.release(lease, ReleaseOutcome::Failed);
        assert_eq!(pool.worker(id).unwrap().consecutive_failures, 1);

        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(lease, ReleaseOutcome::Healthy);
        assert_eq!(pool.worker(id).unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_broken_release_replaces_immediately() {
        let (pool, runtime) = pool(1, 1).await;
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let id = lease.worker_id();
        pool.release(lease, ReleaseOutcome::Broken);

        testing::eventually(|| {
            pool.worker(id)
                .map(|w| w.state == WorkerState::Idle && w.generation == 1)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(runtime.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_replacement_frees_slot_and_top_up_restores() {
        let (pool, runtime) = pool(1, 1).await;
        runtime.fail_create_after(0);

        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(lease, ReleaseOutcome::Broken);
        testing::eventually(|| pool.stats().total == 0).await;

        runtime.allow_creates();
        assert_eq!(pool.top_up(), 1);
        testing::eventually(|| pool.stats().idle == 1).await;
    }

    #[tokio::test]
    async fn test_dropped_lease_counts_as_failure() {
        let (pool, _runtime) = pool(1, 1).await;
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let id = lease.worker_id();
        drop(lease);

        let worker = pool.worker(id).unwrap();
        assert_eq!(worker.state, WorkerState::Idle);
        assert_eq!(worker.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_probe_checkout() {
        let (pool, _runtime) = pool(2, 2).await;
        let id = pool.idle_workers()[0];

        let lease = pool.checkout_for_probe(id).unwrap();
        assert_eq!(pool.worker(id).unwrap().state, WorkerState::Busy);
        assert!(pool.checkout_for_probe(id).is_none());

        // The other worker is still leasable
        let other = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_ne!(other.worker_id(), id);

        lease.finish_probe(true);
        let worker = pool.worker(id).unwrap();
        assert_eq!(worker.state, WorkerState::Idle);
        assert!(worker.last_used_at.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_busy_lease() {
        let (pool, runtime) = pool(2, 2).await;
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let shutdown = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown().await })
        };

        testing::eventually(|| pool.stats().total == 1).await;
        assert!(matches!(
            pool.acquire(Duration::from_millis(50)).await,
            Err(EngineError::PoolShuttingDown)
        ));
        assert!(!shutdown.is_finished());

        pool.release(lease, ReleaseOutcome::Healthy);
        shutdown.await.unwrap();

        assert_eq!(pool.stats().total, 0);
        assert_eq!(runtime.live_containers(), 0);
    }
}
