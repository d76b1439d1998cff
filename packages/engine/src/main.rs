// packages/engine/src/main.rs
//! Render Pool Engine
//!
//! Renders GUI snippets to screenshots inside a pool of warm, sandboxed
//! containers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use renderpool_engine::cache::{DiskStore, ResultCache};
use renderpool_engine::dispatch::{PatternValidator, RenderDispatcher, RenderStatus, SubmitterId};
use renderpool_engine::health::HealthMonitor;
use renderpool_engine::observability::{init_metrics, init_tracing};
use renderpool_engine::pool::ContainerPool;
use renderpool_engine::runtime::DockerRuntime;
use renderpool_engine::utils::config::EngineConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "renderpool", version, about = "Render GUI snippets to screenshots in warm containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render each source file and write `<stem>.png` for successes
    Render {
        /// Snippet files to render
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Directory screenshots are written to
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,

        /// Submitter recorded on every request
        #[arg(long, default_value = "cli")]
        submitter: String,
    },

    /// Print the effective configuration as YAML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load().context("Failed to load configuration")?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
        Commands::Render {
            files,
            out_dir,
            submitter,
        } => {
            init_tracing(&config.logging)?;
            init_metrics(&config.metrics)?;
            info!("Starting Render Pool Engine v{}", env!("CARGO_PKG_VERSION"));
            render(config, files, out_dir, SubmitterId::new(submitter)).await
        }
    }
}

async fn render(
    config: EngineConfig,
    files: Vec<PathBuf>,
    out_dir: PathBuf,
    submitter: SubmitterId,
) -> Result<()> {
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let runtime = Arc::new(DockerRuntime::new(
        &config.docker.cli,
        config.docker.sandbox.clone(),
        config.docker_cli_timeout(),
    )?);
    let pool = ContainerPool::initialize(config.pool_config(), runtime, config.backend.build()).await?;

    let shutdown = CancellationToken::new();
    let monitor = config.health.enabled.then(|| {
        HealthMonitor::new(pool.clone(), config.health_config()).spawn(shutdown.clone())
    });

    let cache = Arc::new(ResultCache::new(config.cache_config()));
    let mut dispatcher = RenderDispatcher::new(pool.clone(), cache, config.dispatch_config())
        .with_validator(Arc::new(PatternValidator::new(&config.validator)));
    if let Some(dir) = &config.cache.disk_dir {
        let disk = DiskStore::open(dir)
            .await?
            .with_level(config.cache.disk_compression)
            .with_capacity(config.cache.disk_capacity_bytes);
        disk.enforce_capacity().await?;
        dispatcher = dispatcher.with_disk(disk);
    }
    let dispatcher = Arc::new(dispatcher);

    let jobs = files.iter().map(|path| {
        let dispatcher = dispatcher.clone();
        let submitter = submitter.clone();
        let out_dir = out_dir.as_path();
        async move { render_file(&dispatcher, path, out_dir, submitter).await }
    });

    let failures = tokio::select! {
        results = join_all(jobs) => results.into_iter().filter(|ok| !ok).count(),
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, cleaning up...");
            files.len()
        }
    };

    shutdown.cancel();
    if let Some(monitor) = monitor {
        if let Err(e) = monitor.await {
            warn!("Health monitor ended abnormally: {}", e);
        }
    }
    pool.shutdown().await;

    let stats = dispatcher.cache().stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        entries = stats.entries,
        "Cache summary"
    );

    if failures > 0 {
        anyhow::bail!("{} of {} renders did not produce a screenshot", failures, files.len());
    }
    Ok(())
}

/// Render one file; true when a screenshot was written
async fn render_file(
    dispatcher: &RenderDispatcher,
    path: &Path,
    out_dir: &Path,
    submitter: SubmitterId,
) -> bool {
    let source = match tokio::fs::read_to_string(path).await {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to read {}: {}", path.display(), e);
            return false;
        }
    };

    let request = dispatcher.request(source, submitter);
    let result = dispatcher.submit(&request).await;

    match (result.status, &result.image_bytes) {
        (RenderStatus::Success, Some(image)) => {
            let stem = path.file_stem().unwrap_or(path.as_os_str()).to_string_lossy();
            let target = out_dir.join(format!("{}.png", stem));
            match tokio::fs::write(&target, image).await {
                Ok(()) => {
                    info!(
                        "Rendered {} -> {} ({} bytes, {:?})",
                        path.display(),
                        target.display(),
                        image.len(),
                        result.duration
                    );
                    true
                }
                Err(e) => {
                    error!("Failed to write {}: {}", target.display(), e);
                    false
                }
            }
        }
        (status, _) => {
            warn!(
                "Render of {} failed ({}): {}",
                path.display(),
                status,
                result.error_detail.as_deref().unwrap_or("no detail")
            );
            false
        }
    }
}
