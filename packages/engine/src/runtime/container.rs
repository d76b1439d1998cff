// packages/engine/src/runtime/container.rs
//! Container runtime boundary
//!
//! The pool and dispatcher only ever talk to containers through
//! [`ContainerRuntime`]. Implementations report their own failures as
//! `EngineError::Infra`; a process that ran and exited non-zero is not an
//! error here, it is an [`ExecOutput`] for the render backend to interpret.

use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Identifier assigned to a container by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Docker ids are 64 hex chars; the 12-char prefix is what `docker ps` shows
        let short = self.0.get(..12).unwrap_or(&self.0);
        f.write_str(short)
    }
}

/// One command to run inside a container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecPayload {
    /// Command and arguments
    pub command: Vec<String>,

    /// Extra environment for this execution
    pub env: Vec<(String, String)>,

    /// Bytes written to the command's stdin
    pub stdin: Option<Bytes>,
}

impl ExecPayload {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<Bytes>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// What a finished execution produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    /// Exit code (`None` if the process was killed by a signal)
    pub exit_code: Option<i32>,

    /// Raw standard output
    pub stdout: Bytes,

    /// Standard error, lossily decoded
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Lifecycle and execution operations on isolated containers
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable runtime name (e.g. "docker")
    fn name(&self) -> &'static str;

    /// Create a stopped container
    async fn create(&self, name: &str) -> Result<ContainerId>;

    /// Start a created container
    async fn start(&self, id: &ContainerId) -> Result<()>;

    /// Run a payload inside a started container
    ///
    /// `deadline` is the caller's budget for the whole execution; callers
    /// enforce it themselves and may drop the future when it passes.
    async fn exec(&self, id: &ContainerId, payload: &ExecPayload, deadline: Duration)
        -> Result<ExecOutput>;

    /// Forcibly terminate whatever is executing inside the container,
    /// leaving the container itself running
    async fn kill(&self, id: &ContainerId) -> Result<()>;

    /// Remove the container
    async fn destroy(&self, id: &ContainerId) -> Result<()>;

    /// Remove containers left over from a previous run, returning how many
    async fn reap_orphans(&self) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_display_is_short() {
        let id = ContainerId::new("0123456789abcdef0123456789abcdef");
        assert_eq!(id.to_string(), "0123456789ab");
        assert_eq!(ContainerId::new("fake-1").to_string(), "fake-1");
    }

    #[test]
    fn test_payload_builder() {
        let payload = ExecPayload::new(["render", "--fast"])
            .with_env("RENDER_WIDTH", "800")
            .with_stdin("print('hi')");

        assert_eq!(payload.command, vec!["render", "--fast"]);
        assert_eq!(payload.env, vec![("RENDER_WIDTH".to_string(), "800".to_string())]);
        assert_eq!(payload.stdin.as_deref(), Some(&b"print('hi')"[..]));
    }
}
