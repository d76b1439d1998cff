// packages/engine/src/runtime/docker.rs
//! Docker-backed container runtime
//!
//! Each operation is one `docker` CLI invocation through [`ProcessManager`].
//! Containers are created stopped with the sandbox flags, started with a
//! keepalive command, and renders run in them with `docker exec -i`.
//!
//! ```text
//! create ──► docker create --name … --label … --network none … IMAGE KEEPALIVE
//! start  ──► docker start ID
//! exec   ──► docker exec -i -e K=V -w DIR ID CMD…   (payload on stdin)
//! kill   ──► docker exec ID sh -c <reaper>
//! destroy──► docker rm -f ID
//! ```

use crate::runtime::container::{ContainerId, ContainerRuntime, ExecOutput, ExecPayload};
use crate::runtime::process_manager::{CommandOutput, ProcessManager};
use crate::runtime::sandbox::SandboxConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exit codes `docker exec` uses for its own failures
/// (125: daemon error, 126: command not executable, 127: command not found)
const DOCKER_EXEC_FAILURE_CODES: [i32; 3] = [125, 126, 127];

/// How the docker client prefixes errors reported by the daemon
const DAEMON_ERROR_PREFIX: &str = "Error response from daemon:";

/// Container runtime driving the docker CLI
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    process: ProcessManager,
    sandbox: SandboxConfig,
    cli_timeout: Duration,
}

impl DockerRuntime {
    /// Locate the docker CLI and build a runtime
    pub fn new(cli: &str, sandbox: SandboxConfig, cli_timeout: Duration) -> Result<Self> {
        sandbox.validate().map_err(EngineError::Config)?;
        let process = ProcessManager::locate(cli)?;
        Ok(Self::with_process(process, sandbox, cli_timeout))
    }

    /// Build a runtime around an already-located CLI
    pub fn with_process(
        process: ProcessManager,
        sandbox: SandboxConfig,
        cli_timeout: Duration,
    ) -> Self {
        Self {
            process,
            sandbox,
            cli_timeout,
        }
    }

    pub fn sandbox(&self) -> &SandboxConfig {
        &self.sandbox
    }

    /// Arguments for `docker exec` running `payload` in `id`
    pub fn exec_args(&self, id: &ContainerId, payload: &ExecPayload) -> Vec<String> {
        let mut args = vec!["exec".to_string()];

        if payload.stdin.is_some() {
            args.push("-i".to_string());
        }

        for (key, value) in &payload.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push("-w".to_string());
        args.push(self.sandbox.work_dir.clone());
        args.push(id.as_str().to_string());
        args.extend(payload.command.iter().cloned());
        args
    }

    async fn docker(&self, args: Vec<String>) -> Result<CommandOutput> {
        self.process.run(&args, self.cli_timeout).await.map_err(|e| match e {
            EngineError::ExecutionTimeout => EngineError::Infra(format!(
                "docker {} did not finish within {:?}",
                args.first().map(String::as_str).unwrap_or_default(),
                self.cli_timeout
            )),
            other => other,
        })
    }
}

/// Whether a finished `docker exec` failed in docker rather than in the payload
///
/// Render payloads remap 125-127 to 1, so those codes only come from docker.
/// A daemon error counts only when it is the whole story: non-zero exit,
/// nothing on stdout, and the first stderr line carries the client prefix.
fn is_docker_failure(output: &CommandOutput) -> bool {
    let Some(code) = output.exit_code else {
        return false;
    };
    if DOCKER_EXEC_FAILURE_CODES.contains(&code) {
        return true;
    }

    code != 0
        && output.stdout.is_empty()
        && output
            .stderr
            .lines()
            .next()
            .map_or(false, |line| line.starts_with(DAEMON_ERROR_PREFIX))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, name: &str) -> Result<ContainerId> {
        let output = self.docker(self.sandbox.create_args(name)).await?;
        let id = output.stdout_text();

        if id.is_empty() {
            return Err(EngineError::Infra(format!(
                "docker create for {} returned no container id",
                name
            )));
        }

        let id = ContainerId::new(id);
        debug!("Created container {} ({})", id, name);
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.docker(vec!["start".to_string(), id.as_str().to_string()])
            .await?;
        debug!("Started container {}", id);
        Ok(())
    }

    async fn exec(
        &self,
        id: &ContainerId,
        payload: &ExecPayload,
        deadline: Duration,
    ) -> Result<ExecOutput> {
        let args = self.exec_args(id, payload);
        let output = self
            .process
            .run_with_stdin(&args, payload.stdin.as_deref(), deadline)
            .await?;

        if is_docker_failure(&output) {
            return Err(EngineError::Infra(format!(
                "docker exec in {} failed (exit {:?}): {}",
                id,
                output.exit_code,
                output.stderr.trim()
            )));
        }

        Ok(ExecOutput {
            exit_code: output.exit_code,
            stdout: Bytes::from(output.stdout),
            stderr: output.stderr,
        })
    }

    async fn kill(&self, id: &ContainerId) -> Result<()> {
        let args = vec![
            "exec".to_string(),
            id.as_str().to_string(),
            "/bin/sh".to_string(),
            "-c".to_string(),
            self.sandbox.reaper_script(),
        ];
        self.docker(args).await?;
        debug!("Killed running processes in container {}", id);
        Ok(())
    }

    async fn destroy(&self, id: &ContainerId) -> Result<()> {
        self.docker(vec![
            "rm".to_string(),
            "-f".to_string(),
            id.as_str().to_string(),
        ])
        .await?;
        debug!("Removed container {}", id);
        Ok(())
    }

    async fn reap_orphans(&self) -> Result<usize> {
        let mut args = vec!["ps".to_string(), "-aq".to_string()];
        args.extend(self.sandbox.label_filters());

        let output = self.docker(args).await?;
        let ids: Vec<String> = output
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        if ids.is_empty() {
            return Ok(0);
        }

        info!("Removing {} leftover pool containers", ids.len());

        let mut removed = 0;
        for id in ids {
            match self.destroy(&ContainerId::new(id.clone())).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove leftover container {}: {}", id, e),
            }
        }

        Ok(removed)
    }
}
