// packages/engine/src/testing.rs
//! Test doubles shared by the unit tests
//!
//! `FakeRuntime` stands in for docker. Render executions (payloads with
//! stdin) behave according to markers in the source:
//!
//! - `HANG`  sleeps far past any deadline
//! - `RAISE` exits 1 with a traceback on stderr
//! - `INFRA` fails as a runtime error
//! - `EMPTY` exits 0 without output
//! - anything else exits 0 with `PNG:<source>` on stdout
//!
//! Payloads without stdin are probes.

use crate::pool::PoolConfig;
use crate::runtime::backend::{EntrypointBackend, RenderBackend};
use crate::runtime::container::{ContainerId, ContainerRuntime, ExecOutput, ExecPayload};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted container runtime
#[derive(Default)]
pub struct FakeRuntime {
    next_id: AtomicUsize,
    pub creates: AtomicUsize,
    pub starts: AtomicUsize,
    pub renders: AtomicUsize,
    pub probes: AtomicUsize,
    pub kills: AtomicUsize,
    pub destroys: AtomicUsize,
    /// Leftover containers reported (and cleared) by `reap_orphans`
    pub orphans: AtomicUsize,
    live: Mutex<HashSet<ContainerId>>,
    running: Mutex<HashMap<ContainerId, usize>>,
    overlap: AtomicBool,
    creates_allowed: Mutex<Option<usize>>,
    failing_probes: Mutex<HashSet<ContainerId>>,
    warm_delay: Mutex<Duration>,
    render_delay: Mutex<Duration>,
    probe_delay: Mutex<Duration>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let runtime = Self::default();
        *runtime.render_delay.lock() = Duration::from_millis(5);
        runtime
    }

    /// Allow `n` more creates, then fail every create
    pub fn fail_create_after(&self, n: usize) {
        *self.creates_allowed.lock() = Some(n);
    }

    pub fn allow_creates(&self) {
        *self.creates_allowed.lock() = None;
    }

    /// Delay applied to every `start`
    pub fn set_warm_delay(&self, delay: Duration) {
        *self.warm_delay.lock() = delay;
    }

    pub fn set_render_delay(&self, delay: Duration) {
        *self.render_delay.lock() = delay;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock() = delay;
    }

    /// Make probes against `id` fail from now on
    pub fn fail_probes(&self, id: &ContainerId) {
        self.failing_probes.lock().insert(id.clone());
    }

    pub fn live_containers(&self) -> usize {
        self.live.lock().len()
    }

    /// Whether two executions ever ran in one container at the same time
    pub fn overlap_detected(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    fn check_live(&self, id: &ContainerId) -> Result<()> {
        if self.live.lock().contains(id) {
            Ok(())
        } else {
            Err(EngineError::Infra(format!("No such container: {}", id)))
        }
    }
}

/// Tracks one in-flight execution; cleared even if the exec is cancelled
struct Running<'a> {
    runtime: &'a FakeRuntime,
    id: ContainerId,
}

impl<'a> Running<'a> {
    fn enter(runtime: &'a FakeRuntime, id: &ContainerId) -> Self {
        let mut running = runtime.running.lock();
        let count = running.entry(id.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            runtime.overlap.store(true, Ordering::SeqCst);
        }
        Self {
            runtime,
            id: id.clone(),
        }
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.runtime.running.lock().get_mut(&self.id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, _name: &str) -> Result<ContainerId> {
        {
            let mut allowed = self.creates_allowed.lock();
            if let Some(remaining) = allowed.as_mut() {
                if *remaining == 0 {
                    return Err(EngineError::Infra("create refused".into()));
                }
                *remaining -= 1;
            }
        }

        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = ContainerId::new(format!(
            "fake-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        self.live.lock().insert(id.clone());
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.check_live(id)?;
        let delay = *self.warm_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(
        &self,
        id: &ContainerId,
        payload: &ExecPayload,
        _deadline: Duration,
    ) -> Result<ExecOutput> {
        self.check_live(id)?;

        let Some(stdin) = &payload.stdin else {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let delay = *self.probe_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let healthy = !self.failing_probes.lock().contains(id);
            return Ok(ExecOutput {
                exit_code: Some(if healthy { 0 } else { 1 }),
                ..Default::default()
            });
        };

        let _running = Running::enter(self, id);
        self.renders.fetch_add(1, Ordering::SeqCst);
        let source = String::from_utf8_lossy(stdin).into_owned();

        let delay = *self.render_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if source.contains("HANG") {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if source.contains("INFRA") {
            return Err(EngineError::Infra("exec failed to start".into()));
        }
        if source.contains("RAISE") {
            return Ok(ExecOutput {
                exit_code: Some(1),
                stdout: Bytes::new(),
                stderr: "Traceback (most recent call last):\n  File \"main.py\", line 1\nRuntimeError: boom\n".into(),
            });
        }
        if source.contains("EMPTY") {
            return Ok(ExecOutput {
                exit_code: Some(0),
                ..Default::default()
            });
        }

        Ok(ExecOutput {
            exit_code: Some(0),
            stdout: Bytes::from(format!("PNG:{}", source)),
            stderr: String::new(),
        })
    }

    async fn kill(&self, id: &ContainerId) -> Result<()> {
        self.check_live(id)?;
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self, id: &ContainerId) -> Result<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.live.lock().remove(id);
        Ok(())
    }

    async fn reap_orphans(&self) -> Result<usize> {
        Ok(self.orphans.swap(0, Ordering::SeqCst))
    }
}

/// Pool configuration with test-sized timeouts
pub fn pool_config(min_warm: usize, max_total: usize) -> PoolConfig {
    PoolConfig {
        min_warm,
        max_total,
        failure_threshold: 3,
        warmup_timeout: Duration::from_secs(5),
        warmup_probe_interval: Duration::from_millis(10),
        name_prefix: "test-worker".to_string(),
    }
}

pub fn backend() -> Arc<dyn RenderBackend> {
    Arc::new(EntrypointBackend::new(vec!["render".to_string()]))
}

/// Poll `condition` until it holds, failing the test after ~5s
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
