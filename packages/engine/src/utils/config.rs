// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Layered, lowest priority first:
//!
//! 1. Built-in defaults
//! 2. YAML file (`RENDERPOOL_CONFIG`, default `renderpool.yaml`; may be absent)
//! 3. Environment variables, e.g. `RENDERPOOL__POOL__MIN_WARM=3`

use crate::cache::{CacheConfig, CompressionLevel, DEFAULT_DISK_CAPACITY_BYTES};
use crate::dispatch::dispatcher::DispatchConfig;
use crate::dispatch::display::DisplaySize;
use crate::dispatch::validator::ValidatorConfig;
use crate::health::HealthConfig;
use crate::observability::{LoggingConfig, MetricsConfig};
use crate::pool::PoolConfig;
use crate::runtime::{BackendConfig, SandboxConfig};
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Variable naming the config file
pub const CONFIG_PATH_ENV: &str = "RENDERPOOL_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "renderpool.yaml";
pub const ENV_PREFIX: &str = "RENDERPOOL";

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolSettings,
    pub render: RenderSettings,
    pub cache: CacheSettings,
    pub health: HealthSettings,
    pub docker: DockerSettings,
    pub backend: BackendConfig,
    pub validator: ValidatorConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_warm: usize,
    pub max_total: usize,
    pub failure_threshold: u32,
    pub warmup_timeout_secs: u64,
    pub warmup_probe_interval_ms: u64,
    pub name_prefix: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_warm: 2,
            max_total: 5,
            failure_threshold: 3,
            warmup_timeout_secs: 30,
            warmup_probe_interval_ms: 500,
            name_prefix: "renderpool-worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub timeout_secs: u64,
    pub acquire_timeout_secs: u64,
    pub kill_timeout_secs: u64,
    pub infra_retries: u32,
    pub cache_timeouts: bool,
    pub max_image_bytes: usize,
    pub max_display: DisplaySize,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            acquire_timeout_secs: 10,
            kill_timeout_secs: 5,
            infra_retries: 1,
            cache_timeouts: false,
            max_image_bytes: 50 * 1024 * 1024,
            max_display: DisplaySize::new(1920, 1080),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub capacity_bytes: usize,
    /// Idle TTL; unset keeps entries until evicted
    pub max_age_secs: Option<u64>,
    /// Enables the on-disk tier
    pub disk_dir: Option<PathBuf>,
    pub disk_compression: CompressionLevel,
    /// Byte budget for `disk_dir`; oldest entries are deleted past it
    pub disk_capacity_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024,
            max_age_secs: None,
            disk_dir: None,
            disk_compression: CompressionLevel::Fast,
            disk_capacity_bytes: DEFAULT_DISK_CAPACITY_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            probe_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// CLI executable, looked up on PATH
    pub cli: String,
    /// Budget for create/start/kill/rm invocations
    pub cli_timeout_secs: u64,
    pub sandbox: SandboxConfig,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            cli: "docker".to_string(),
            cli_timeout_secs: 60,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from the default file location and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from `path` (if it exists) and the environment
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::build(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn build(path: &Path, env: Environment) -> Result<Self> {
        let config: EngineConfig = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml).required(false))
            .add_source(env.separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.pool_config().validate().map_err(EngineError::Config)?;

        let render = &self.render;
        if render.timeout_secs == 0 || render.acquire_timeout_secs == 0 || render.kill_timeout_secs == 0 {
            return Err(EngineError::Config("render timeouts must be non-zero".to_string()));
        }
        if render.max_image_bytes == 0 {
            return Err(EngineError::Config("max_image_bytes must be non-zero".to_string()));
        }
        if render.max_display.width == 0 || render.max_display.height == 0 {
            return Err(EngineError::Config("max_display must be non-zero".to_string()));
        }

        if self.cache.capacity_bytes == 0 {
            return Err(EngineError::Config("cache capacity must be non-zero".to_string()));
        }
        if self.cache.disk_capacity_bytes == 0 {
            return Err(EngineError::Config("cache disk_capacity_bytes must be non-zero".to_string()));
        }
        if self.cache.max_age_secs == Some(0) {
            return Err(EngineError::Config("cache max_age_secs must be non-zero when set".to_string()));
        }

        if self.health.interval_secs == 0 || self.health.probe_timeout_secs == 0 {
            return Err(EngineError::Config("health intervals must be non-zero".to_string()));
        }

        if self.docker.cli.trim().is_empty() {
            return Err(EngineError::Config("docker cli cannot be empty".to_string()));
        }
        if self.docker.cli_timeout_secs == 0 {
            return Err(EngineError::Config("docker cli_timeout_secs must be non-zero".to_string()));
        }
        self.docker.sandbox.validate().map_err(EngineError::Config)?;
        self.backend.validate().map_err(EngineError::Config)?;

        Ok(())
    }

    /// Effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn pool_config(&self) -> PoolConfig {
        let pool = &self.pool;
        PoolConfig {
            min_warm: pool.min_warm,
            max_total: pool.max_total,
            failure_threshold: pool.failure_threshold,
            warmup_timeout: Duration::from_secs(pool.warmup_timeout_secs),
            warmup_probe_interval: Duration::from_millis(pool.warmup_probe_interval_ms),
            name_prefix: pool.name_prefix.clone(),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        let render = &self.render;
        DispatchConfig {
            render_timeout: Duration::from_secs(render.timeout_secs),
            acquire_timeout: Duration::from_secs(render.acquire_timeout_secs),
            kill_timeout: Duration::from_secs(render.kill_timeout_secs),
            infra_retries: render.infra_retries,
            cache_timeouts: render.cache_timeouts,
            max_image_bytes: render.max_image_bytes,
            max_display: render.max_display,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity_bytes: self.cache.capacity_bytes,
            max_age: self.cache.max_age_secs.map(Duration::from_secs),
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.health.interval_secs),
            probe_timeout: Duration::from_secs(self.health.probe_timeout_secs),
        }
    }

    pub fn docker_cli_timeout(&self) -> Duration {
        Duration::from_secs(self.docker.cli_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    fn missing_file() -> PathBuf {
        PathBuf::from("/nonexistent/renderpool.yaml")
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::build(&missing_file(), env(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());

        let pool = config.pool_config();
        assert_eq!(pool.min_warm, 2);
        assert_eq!(pool.max_total, 5);
        assert_eq!(pool.failure_threshold, 3);

        let dispatch = config.dispatch_config();
        assert_eq!(dispatch, DispatchConfig::default());
        assert_eq!(config.cache_config(), CacheConfig::default());
        assert_eq!(config.health_config(), HealthConfig::default());
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "pool:\n  min_warm: 1\n  max_total: 8\nrender:\n  timeout_secs: 12\ncache:\n  max_age_secs: 600\nbackend:\n  kind: template\n  interpreter: [python3]\n  work_dir: /tmp/render\n  probe: [python3, -c, pass]\n"
        )
        .unwrap();

        let config = EngineConfig::build(file.path(), env(&[])).unwrap();
        assert_eq!(config.pool.min_warm, 1);
        assert_eq!(config.pool.max_total, 8);
        assert_eq!(config.pool.failure_threshold, 3);
        assert_eq!(config.dispatch_config().render_timeout, Duration::from_secs(12));
        assert_eq!(config.cache_config().max_age, Some(Duration::from_secs(600)));
        assert!(matches!(config.backend, BackendConfig::Template { .. }));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "pool:\n  min_warm: 1\n").unwrap();

        let config = EngineConfig::build(
            file.path(),
            env(&[
                ("RENDERPOOL__POOL__MIN_WARM", "3"),
                ("RENDERPOOL__RENDER__CACHE_TIMEOUTS", "true"),
            ]),
        )
        .unwrap();
        assert_eq!(config.pool.min_warm, 3);
        assert!(config.render.cache_timeouts);
    }

    #[test]
    fn test_rejects_min_above_max() {
        let err = EngineConfig::build(
            &missing_file(),
            env(&[
                ("RENDERPOOL__POOL__MIN_WARM", "6"),
                ("RENDERPOOL__POOL__MAX_TOTAL", "5"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = EngineConfig::default();
        config.pool.max_total = 0;
        config.pool.min_warm = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.render.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.cache.capacity_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.cache.disk_capacity_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.docker.sandbox.resources.memory_limit_mb = Some(32);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = EngineConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("min_warm: 2"));
        assert!(yaml.contains("kind: entrypoint"));

        let parsed: EngineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
