// packages/engine/src/observability/mod.rs
//! Logging and metrics
//!
//! `init_tracing` installs the global tracing subscriber and `init_metrics`
//! the Prometheus recorder. Both are process-wide and called once from the
//! binary. Library code only uses the `tracing` and `metrics` macros, so it
//! runs fine without either installed (as in the unit tests).

use crate::dispatch::result::RenderResult;
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const RENDERS_ATTEMPTED: &str = "renderpool_renders_attempted_total";
pub const RENDERS: &str = "renderpool_renders_total";
pub const RENDER_DURATION: &str = "renderpool_render_duration_seconds";
pub const SCREENSHOT_BYTES: &str = "renderpool_screenshot_bytes";
pub const CACHE_LOOKUPS: &str = "renderpool_cache_lookups_total";
pub const WORKERS: &str = "renderpool_workers";
pub const WORKER_REPLACEMENTS: &str = "renderpool_worker_replacements_total";
pub const HEALTH_PROBES: &str = "renderpool_health_probes_total";

/// Render durations span cache hits (sub-millisecond) to the 30s limit
const DURATION_BUCKETS: &[f64] = &[0.005, 0.05, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0];

const SIZE_BUCKETS: &[f64] = &[
    1024.0,
    16.0 * 1024.0,
    64.0 * 1024.0,
    256.0 * 1024.0,
    1024.0 * 1024.0,
    4.0 * 1024.0 * 1024.0,
    16.0 * 1024.0 * 1024.0,
];

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset (default: "info")
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Metrics exporter settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics` on this address; metrics are still recorded when unset
    pub listen_addr: Option<SocketAddr>,
}

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| EngineError::Config(format!("invalid log level '{}': {}", config.level, e)))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false))
            .try_init()
    };

    installed.map_err(|e| EngineError::Observability(e.to_string()))
}

/// Install the Prometheus recorder, with an HTTP listener if configured
///
/// Must be called from within a tokio runtime when a listener is configured.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(RENDER_DURATION.to_string()), DURATION_BUCKETS)
        .and_then(|b| b.set_buckets_for_metric(Matcher::Full(SCREENSHOT_BYTES.to_string()), SIZE_BUCKETS))
        .map_err(|e| EngineError::Observability(e.to_string()))?;

    match config.listen_addr {
        Some(addr) => {
            builder
                .with_http_listener(addr)
                .install()
                .map_err(|e| EngineError::Observability(e.to_string()))?;
            info!("Metrics exporter listening on {}", addr);
        }
        None => {
            builder
                .install_recorder()
                .map_err(|e| EngineError::Observability(e.to_string()))?;
        }
    }

    Ok(())
}

/// Record a finished `submit`
pub fn record_render(result: &RenderResult) {
    metrics::counter!(RENDERS, "status" => result.status.as_str()).increment(1);
    metrics::histogram!(RENDER_DURATION).record(result.duration.as_secs_f64());
    if let Some(image) = &result.image_bytes {
        metrics::histogram!(SCREENSHOT_BYTES).record(image.len() as f64);
    }
}

/// Record a cache lookup (`memory_hit`, `disk_hit` or `miss`)
pub fn record_cache_lookup(result: &'static str) {
    metrics::counter!(CACHE_LOOKUPS, "result" => result).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.json);
    }

    #[test]
    fn test_metrics_config_parses_address() {
        let config: MetricsConfig =
            serde_yaml::from_str("listen_addr: 127.0.0.1:9100").unwrap();
        assert_eq!(config.listen_addr, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn test_bucket_bounds_are_sorted() {
        assert!(DURATION_BUCKETS.windows(2).all(|w| w[0] < w[1]));
        assert!(SIZE_BUCKETS.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let result = RenderResult::success(bytes::Bytes::from_static(b"png"), std::time::Duration::from_millis(3));
        record_render(&result);
        record_cache_lookup("miss");
    }
}
