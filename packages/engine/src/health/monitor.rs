// packages/engine/src/health/monitor.rs
//! Health monitor
//!
//! Periodically probes Idle workers and replaces the ones that no longer
//! answer, e.g. a container whose display server died while it sat idle.
//!
//! A probe takes its worker out of rotation under a probe lease, so a probe
//! and a render can never share a container. Probes run in batches sized to
//! leave one worker Idle, so a round never makes `acquire` wait or grow the
//! pool; a lone Idle worker is still probed by itself. Busy, Warming and
//! Terminating workers are never probed.

use crate::observability;
use crate::pool::{ContainerPool, WorkerId, WorkerLease};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health monitor configuration
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    /// Time between probe rounds (default: 60s)
    pub interval: Duration,

    /// Budget for one probe (default: 5s)
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of one probe round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Workers probed
    pub probed: usize,
    /// Workers that failed and are being replaced
    pub failed: usize,
    /// Workers added to get back to `min_warm`
    pub replenished: usize,
}

/// Background prober for idle workers
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    pool: ContainerPool,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(pool: ContainerPool, config: HealthConfig) -> Self {
        Self { pool, config }
    }

    /// Probe every currently Idle worker once
    pub async fn run_once(&self) -> HealthReport {
        let mut pending: VecDeque<WorkerId> = self.pool.idle_workers().into();
        let mut probed = 0;
        let mut failed = 0;

        while !pending.is_empty() {
            let spare = self.pool.idle_workers().len().saturating_sub(1).max(1);
            let batch: Vec<WorkerId> = pending.drain(..spare.min(pending.len())).collect();

            let probes = batch.into_iter().filter_map(|id| {
                // Leased or replaced since the listing; skip it
                let lease = self.pool.checkout_for_probe(id)?;
                Some(self.probe(lease))
            });
            let results = futures::future::join_all(probes).await;

            probed += results.len();
            failed += results.iter().filter(|healthy| !**healthy).count();
        }

        let report = HealthReport {
            probed,
            failed,
            replenished: self.pool.top_up(),
        };
        debug!(?report, "Health round finished");
        report
    }

    async fn probe(&self, lease: WorkerLease) -> bool {
        let healthy = lease.probe(self.config.probe_timeout).await;
        let result = if healthy { "pass" } else { "fail" };
        metrics::counter!(observability::HEALTH_PROBES, "result" => result).increment(1);
        if !healthy {
            warn!(worker = %lease.worker_id(), "Health probe failed");
        }
        lease.finish_probe(healthy);
        healthy
    }

    /// Run probe rounds every `interval` until cancelled
    ///
    /// The first round happens one interval after start.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                "Health monitor starting"
            );

            let start = tokio::time::Instant::now() + self.config.interval;
            let mut interval = tokio::time::interval_at(start, self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        info!("Health monitor shutting down");
                        break;
                    }

                    _ = interval.tick() => {
                        let report = self.run_once().await;
                        if report.failed > 0 || report.replenished > 0 {
                            info!(
                                probed = report.probed,
                                failed = report.failed,
                                replenished = report.replenished,
                                "Health round repaired pool"
                            );
                        }
                    }
                }
            }
        })
    }
}
