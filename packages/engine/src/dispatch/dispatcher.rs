// packages/engine/src/dispatch/dispatcher.rs
//! Render dispatcher
//!
//! Turns a [`RenderRequest`] into a [`RenderResult`]. Per-request failures
//! never escape as errors; every path ends in a status.
//!
//! ```text
//! submit
//!   ├─ validate ──────────────► ValidationRejected   (not cached)
//!   ├─ memory cache / disk ───► cached result
//!   ├─ acquire ───────────────► PoolExhausted        (not cached)
//!   └─ execute under deadline
//!        ├─ image ────────────► Success       (worker Healthy, cached)
//!        ├─ error output ─────► RuntimeError  (worker Healthy, cached)
//!        ├─ deadline passed ──► kill, Timeout (worker Failed)
//!        └─ runtime failure ──► retry on another worker, then InfraFailure
//! ```

use crate::cache::{CachedResult, DiskStore, ResultCache};
use crate::dispatch::display::DisplaySize;
use crate::dispatch::request::{Fingerprint, RenderRequest, SubmitterId};
use crate::dispatch::result::{RenderResult, RenderStatus};
use crate::dispatch::validator::{CodeValidator, PatternValidator, Validation};
use crate::observability;
use crate::pool::{ContainerPool, ReleaseOutcome, WorkerLease};
use crate::runtime::backend::{RenderJob, RenderOutput};
use crate::utils::errors::EngineError;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Wall-clock budget for one execution (default: 30s)
    pub render_timeout: Duration,

    /// How long to wait for a worker (default: 10s)
    pub acquire_timeout: Duration,

    /// Budget for killing a timed-out execution (default: 5s)
    pub kill_timeout: Duration,

    /// Extra attempts on a different worker after a runtime failure (default: 1)
    pub infra_retries: u32,

    /// Also cache Timeout results (default: false)
    pub cache_timeouts: bool,

    /// Largest image returned as a success (default: 50 MiB)
    pub max_image_bytes: usize,

    /// Largest display a snippet may request
    pub max_display: DisplaySize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            render_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
            infra_retries: 1,
            cache_timeouts: false,
            max_image_bytes: 50 * 1024 * 1024,
            max_display: DisplaySize::new(1920, 1080),
        }
    }
}

/// Render dispatcher
pub struct RenderDispatcher {
    pool: ContainerPool,
    cache: Arc<ResultCache>,
    disk: Option<DiskStore>,
    validator: Arc<dyn CodeValidator>,
    config: DispatchConfig,
}

impl RenderDispatcher {
    pub fn new(pool: ContainerPool, cache: Arc<ResultCache>, config: DispatchConfig) -> Self {
        Self {
            pool,
            cache,
            disk: None,
            validator: Arc::new(PatternValidator::default()),
            config,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn CodeValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_disk(mut self, disk: DiskStore) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn pool(&self) -> &ContainerPool {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Build a request bounded by this dispatcher's display limit
    pub fn request(&self, source: impl Into<String>, submitter: SubmitterId) -> RenderRequest {
        RenderRequest::new(source, submitter, self.config.max_display)
    }

    /// Render a request, serving it from cache when possible
    pub async fn submit(&self, request: &RenderRequest) -> RenderResult {
        let span = info_span!(
            "render",
            request = %request.id,
            fingerprint = %request.fingerprint.short(),
            submitter = %request.submitter_id,
        );

        async move {
            let started = Instant::now();
            metrics::counter!(observability::RENDERS_ATTEMPTED).increment(1);

            if let Validation::Rejected(reason) = self.validator.validate(&request.source_code) {
                info!(%reason, "Rejected by validator");
                let result = RenderResult::failure(
                    RenderStatus::ValidationRejected,
                    reason,
                    started.elapsed(),
                );
                observability::record_render(&result);
                return result;
            }

            if let Some(result) = self.lookup(&request.fingerprint).await {
                debug!(status = %result.status, "Served from cache");
                observability::record_render(&result);
                return result;
            }

            let result = self.render(request, started).await;

            if self.is_cacheable(result.status) {
                self.store(&request.fingerprint, &result).await;
            }

            info!(
                status = %result.status,
                duration_ms = result.duration.as_millis() as u64,
                "Render finished"
            );
            observability::record_render(&result);
            result
        }
        .instrument(span)
        .await
    }

    fn is_cacheable(&self, status: RenderStatus) -> bool {
        match status {
            RenderStatus::Success | RenderStatus::RuntimeError => true,
            RenderStatus::Timeout => self.config.cache_timeouts,
            RenderStatus::ValidationRejected
            | RenderStatus::PoolExhausted
            | RenderStatus::InfraFailure => false,
        }
    }

    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<RenderResult> {
        if let Some(result) = self.cache.get(fingerprint) {
            observability::record_cache_lookup("memory_hit");
            return Some(result);
        }

        if let Some(disk) = &self.disk {
            match disk.load(fingerprint, self.cache.config().max_age).await {
                Ok(Some(cached)) => {
                    self.cache
                        .put_at(*fingerprint, cached.result.clone(), cached.stored_at);
                    observability::record_cache_lookup("disk_hit");
                    return Some(cached.result);
                }
                Ok(None) => {}
                Err(e) => warn!("Disk cache lookup failed: {}", e),
            }
        }

        observability::record_cache_lookup("miss");
        None
    }

    async fn store(&self, fingerprint: &Fingerprint, result: &RenderResult) {
        self.cache.put(*fingerprint, result.clone());

        if let Some(disk) = &self.disk {
            let cached = CachedResult {
                result: result.clone(),
                stored_at: Utc::now(),
            };
            if let Err(e) = disk.save(fingerprint, &cached).await {
                warn!("Failed to persist result to disk: {}", e);
            }
        }
    }

    async fn render(&self, request: &RenderRequest, started: Instant) -> RenderResult {
        let job = RenderJob {
            source: &request.normalized_code,
            display: request.display,
            deadline: self.config.render_timeout,
        };
        let mut attempt = 0;

        loop {
            let lease = match self.pool.acquire(self.config.acquire_timeout).await {
                Ok(lease) => lease,
                Err(e) => {
                    warn!("No worker available: {}", e);
                    let detail = match e {
                        EngineError::PoolShuttingDown => "render service is shutting down",
                        _ => "all render workers are busy, try again shortly",
                    };
                    return RenderResult::failure(
                        RenderStatus::PoolExhausted,
                        detail,
                        started.elapsed(),
                    );
                }
            };

            debug!(worker = %lease.worker_id(), attempt, "Executing");
            let outcome = tokio::time::timeout(self.config.render_timeout, lease.execute(&job)).await;

            match outcome {
                Ok(Ok(RenderOutput::Image(image))) => {
                    lease.release(ReleaseOutcome::Healthy);
                    if image.len() > self.config.max_image_bytes {
                        return RenderResult::failure(
                            RenderStatus::RuntimeError,
                            format!(
                                "rendered image exceeds {} bytes ({} bytes)",
                                self.config.max_image_bytes,
                                image.len()
                            ),
                            started.elapsed(),
                        );
                    }
                    return RenderResult::success(image, started.elapsed());
                }
                Ok(Ok(RenderOutput::Error(detail))) => {
                    lease.release(ReleaseOutcome::Healthy);
                    return RenderResult::failure(
                        RenderStatus::RuntimeError,
                        detail,
                        started.elapsed(),
                    );
                }
                Ok(Err(EngineError::ExecutionTimeout)) | Err(_) => {
                    self.abandon(lease).await;
                    return RenderResult::failure(
                        RenderStatus::Timeout,
                        format!(
                            "render exceeded the {}s time limit",
                            self.config.render_timeout.as_secs()
                        ),
                        started.elapsed(),
                    );
                }
                Ok(Err(e)) if e.is_infra() && attempt < self.config.infra_retries => {
                    warn!(worker = %lease.worker_id(), error = %e, "Runtime failure, retrying");
                    lease.release(ReleaseOutcome::Broken);
                    attempt += 1;
                }
                Ok(Err(e)) => {
                    warn!(worker = %lease.worker_id(), error = %e, "Runtime failure");
                    lease.release(ReleaseOutcome::Broken);
                    return RenderResult::failure(
                        RenderStatus::InfraFailure,
                        format!("render infrastructure failed: {}", e),
                        started.elapsed(),
                    );
                }
            }
        }
    }

    /// Kill a timed-out execution and hand the worker back with a strike
    async fn abandon(&self, lease: WorkerLease) {
        warn!(
            worker = %lease.worker_id(),
            "Render exceeded {:?}, killing",
            self.config.render_timeout
        );

        match tokio::time::timeout(self.config.kill_timeout, lease.kill()).await {
            Ok(Ok(())) => lease.release(ReleaseOutcome::Failed),
            Ok(Err(e)) => {
                warn!(worker = %lease.worker_id(), "Kill failed: {}", e);
                lease.release(ReleaseOutcome::Broken);
            }
            Err(_) => {
                warn!(worker = %lease.worker_id(), "Kill did not finish in {:?}", self.config.kill_timeout);
                lease.release(ReleaseOutcome::Broken);
            }
        }
    }
}
