// packages/engine/src/runtime/sandbox.rs
//! Sandbox settings for worker containers
//!
//! Provides:
//! - CPU and memory ceilings (via `ResourceLimits`)
//! - Network isolation
//! - A size-bounded, non-executable tmpfs for scratch files
//! - Privilege escalation lockdown
//! - Pool labels so leftover containers can be found and reaped

use crate::runtime::resource_limiter::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Image every worker container is created from
    pub image: String,

    /// Disable all networking inside the container
    pub isolate_network: bool,

    /// Size of the `/tmp` tmpfs in MB (0 disables it)
    pub tmpfs_size_mb: u64,

    /// Forbid privilege escalation (`no-new-privileges`)
    pub no_new_privileges: bool,

    /// Mount the root filesystem read-only
    pub read_only_root: bool,

    /// Working directory for executions
    pub work_dir: String,

    /// Long-running command that keeps an idle container alive
    pub keepalive: Vec<String>,

    /// Environment variables set on the container
    pub env: BTreeMap<String, String>,

    /// Labels identifying containers owned by this pool
    pub labels: BTreeMap<String, String>,

    /// Extended regex of process command lines that survive a kill
    /// (e.g. a display server started by the image entrypoint)
    pub preserve_processes: Option<String>,

    /// Resource ceilings
    pub resources: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "renderpool".to_string());
        labels.insert("role".to_string(), "render-worker".to_string());

        let mut env = BTreeMap::new();
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        Self {
            image: "renderpool-runtime:latest".to_string(),
            isolate_network: true,
            tmpfs_size_mb: 80,
            no_new_privileges: true,
            read_only_root: false,
            work_dir: "/work".to_string(),
            keepalive: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "while true; do sleep 30; done".to_string(),
            ],
            env,
            labels,
            preserve_processes: None,
            resources: ResourceLimits::default(),
        }
    }
}

impl SandboxConfig {
    /// Validate the sandbox settings
    pub fn validate(&self) -> Result<(), String> {
        if self.image.trim().is_empty() {
            return Err("Sandbox image cannot be empty".to_string());
        }
        if self.keepalive.is_empty() {
            return Err("Keepalive command cannot be empty".to_string());
        }
        if self.labels.is_empty() {
            return Err("At least one pool label is required".to_string());
        }
        self.resources.validate()
    }

    /// Full argument list for `docker create`
    pub fn create_args(&self, name: &str) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), name.to_string()];

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        if self.isolate_network {
            args.push("--network".to_string());
            args.push("none".to_string());
        }

        if self.tmpfs_size_mb > 0 {
            args.push("--tmpfs".to_string());
            args.push(format!("/tmp:size={}m,noexec,nosuid,nodev", self.tmpfs_size_mb));
        }

        if self.no_new_privileges {
            args.push("--security-opt".to_string());
            args.push("no-new-privileges:true".to_string());
        }

        if self.read_only_root {
            args.push("--read-only".to_string());
        }

        args.push("-w".to_string());
        args.push(self.work_dir.clone());

        args.extend(self.resources.docker_args());

        args.push(self.image.clone());
        args.extend(self.keepalive.iter().cloned());
        args
    }

    /// `--filter` arguments matching every container this pool owns
    pub fn label_filters(&self) -> Vec<String> {
        self.labels
            .iter()
            .flat_map(|(key, value)| ["--filter".to_string(), format!("label={}={}", key, value)])
            .collect()
    }

    /// Shell script that kills everything running in the container except
    /// PID 1, the script itself, and preserved processes
    pub fn reaper_script(&self) -> String {
        let keep = match &self.preserve_processes {
            Some(pattern) => format!(
                "if echo \"$cmd\" | grep -q -E '{}'; then continue; fi; ",
                pattern.replace('\'', "")
            ),
            None => String::new(),
        };

        format!(
            "for p in /proc/[0-9]*; do \
             pid=${{p#/proc/}}; \
             [ \"$pid\" -eq 1 ] && continue; \
             [ \"$pid\" -eq \"$$\" ] && continue; \
             [ ! -d \"$p\" ] && continue; \
             cmd=$(tr '\\0' ' ' < \"$p/cmdline\" 2>/dev/null); \
             {keep}kill -9 \"$pid\" 2>/dev/null; \
             done; true"
        )
    }
}
