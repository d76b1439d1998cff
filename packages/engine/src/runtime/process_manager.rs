// packages/engine/src/runtime/process_manager.rs
//! Process manager for driving the container CLI
//!
//! Every container operation is one short-lived CLI invocation. The manager
//! locates the executable once, spawns it with piped stdio, optionally feeds
//! stdin, and bounds the whole invocation with a timeout. Children are
//! spawned with `kill_on_drop`, so abandoning the future kills the client.

use crate::utils::errors::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, trace};

/// Captured output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (`None` if killed by a signal)
    pub exit_code: Option<i32>,

    /// Raw standard output
    pub stdout: Vec<u8>,

    /// Standard error, lossily decoded
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Standard output as trimmed text
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Process manager for one CLI executable
#[derive(Debug, Clone)]
pub struct ProcessManager {
    /// Resolved executable path
    executable: PathBuf,
}

impl ProcessManager {
    /// Locate `command` in PATH (or accept an explicit path)
    pub fn locate(command: &str) -> Result<Self> {
        match which::which(command) {
            Ok(path) => {
                info!("Found {} at {:?}", command, path);
                Ok(Self { executable: path })
            }
            Err(e) => Err(EngineError::Infra(format!(
                "Executable '{}' not found in PATH: {}",
                command, e
            ))),
        }
    }

    /// Use an executable path without lookup
    pub fn with_executable(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Resolved executable path
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Run a command to completion, failing with `Infra` on a non-zero exit
    pub async fn run(&self, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        let output = self.run_with_stdin(args, None, timeout).await?;

        if !output.success() {
            return Err(EngineError::Infra(format!(
                "{} {} failed ({}): {}",
                self.executable.display(),
                args.first().map(String::as_str).unwrap_or_default(),
                describe_exit(output.exit_code),
                output.stderr.trim()
            )));
        }

        Ok(output)
    }

    /// Run a command, feeding `stdin` if given, and return whatever it
    /// produced regardless of exit status
    pub async fn run_with_stdin(
        &self,
        args: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        debug!(
            "Spawning {:?} {}",
            self.executable,
            args.first().map(String::as_str).unwrap_or_default()
        );

        let mut command = Command::new(&self.executable);
        command
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            EngineError::Infra(format!("Failed to spawn {:?}: {}", self.executable, e))
        })?;

        trace!("Process spawned with PID: {:?}", child.id());

        let pipe = match stdin {
            Some(_) => Some(
                child
                    .stdin
                    .take()
                    .ok_or_else(|| EngineError::Infra("Failed to capture stdin".into()))?,
            ),
            None => None,
        };

        // Feed stdin while draining stdout so large payloads cannot deadlock
        let feed = async move {
            if let (Some(mut pipe), Some(input)) = (pipe, stdin) {
                pipe.write_all(input).await?;
                // Closing stdin signals end of payload
                drop(pipe);
            }
            Ok::<(), std::io::Error>(())
        };

        let (fed, output) = tokio::time::timeout(timeout, async {
            tokio::join!(feed, child.wait_with_output())
        })
        .await
        .map_err(|_| EngineError::ExecutionTimeout)?;

        let output =
            output.map_err(|e| EngineError::Infra(format!("Failed to wait for process: {}", e)))?;

        if let Err(e) = fed {
            // The process may legitimately exit without reading its input
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(EngineError::Infra(format!("Failed to write to stdin: {}", e)));
            }
            debug!("Process closed stdin early");
        }

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "killed by signal".to_string(),
    }
}
