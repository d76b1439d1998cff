// packages/engine/src/runtime/resource_limiter.rs
//! Resource ceilings for render containers
//!
//! Provides control over:
//! - CPU usage (percentage of one core)
//! - Memory consumption (MB limit)
//! - File size and open file descriptors (ulimits)

use serde::{Deserialize, Serialize};

/// Resource limits applied to every worker container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU quota as percentage (0-100 per core)
    /// Example: 50 = 50% of one CPU core
    pub cpu_quota: Option<u32>,

    /// Memory limit in megabytes
    /// Example: 512 = 512MB RAM limit
    pub memory_limit_mb: Option<u64>,

    /// Largest file a process may write, in megabytes
    pub max_file_size_mb: Option<u64>,

    /// Maximum open file descriptors per process
    pub max_open_files: Option<u32>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_quota: Some(50),         // 50% of one core
            memory_limit_mb: Some(512),  // 512MB
            max_file_size_mb: Some(100), // 100MB
            max_open_files: Some(100),
        }
    }
}

impl ResourceLimits {
    /// Validate resource limits
    pub fn validate(&self) -> Result<(), String> {
        if let Some(quota) = self.cpu_quota {
            if quota == 0 {
                return Err("CPU quota cannot be 0".to_string());
            }
            if quota > 400 {
                return Err("CPU quota cannot exceed 400% (4 cores)".to_string());
            }
        }

        if let Some(memory) = self.memory_limit_mb {
            if memory < 64 {
                return Err("Memory limit cannot be less than 64MB".to_string());
            }
            if memory > 16384 {
                return Err("Memory limit cannot exceed 16GB".to_string());
            }
        }

        if let Some(fsize) = self.max_file_size_mb {
            if fsize == 0 {
                return Err("File size limit cannot be 0".to_string());
            }
        }

        if let Some(files) = self.max_open_files {
            if files < 16 {
                return Err("Open file limit cannot be less than 16".to_string());
            }
        }

        Ok(())
    }

    /// Render the limits as `docker create` flags
    pub fn docker_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(memory) = self.memory_limit_mb {
            args.push("--memory".to_string());
            args.push(format!("{}m", memory));
        }

        if let Some(quota) = self.cpu_quota {
            args.push("--cpus".to_string());
            args.push(format!("{:.2}", quota as f64 / 100.0));
        }

        if let Some(fsize) = self.max_file_size_mb {
            let bytes = fsize * 1024 * 1024;
            args.push("--ulimit".to_string());
            args.push(format!("fsize={}:{}", bytes, bytes));
        }

        if let Some(files) = self.max_open_files {
            args.push("--ulimit".to_string());
            args.push(format!("nofile={}:{}", files, files));
        }

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.cpu_quota, Some(50));
        assert_eq!(limits.memory_limit_mb, Some(512));
        assert_eq!(limits.max_open_files, Some(100));
    }

    #[test]
    fn test_validation() {
        let valid = ResourceLimits::default();
        assert!(valid.validate().is_ok());

        let invalid_cpu = ResourceLimits {
            cpu_quota: Some(0),
            ..Default::default()
        };
        assert!(invalid_cpu.validate().is_err());

        let invalid_memory = ResourceLimits {
            memory_limit_mb: Some(32),
            ..Default::default()
        };
        assert!(invalid_memory.validate().is_err());

        let invalid_files = ResourceLimits {
            max_open_files: Some(4),
            ..Default::default()
        };
        assert!(invalid_files.validate().is_err());
    }

    #[test]
    fn test_docker_args() {
        let args = ResourceLimits::default().docker_args();
        assert_eq!(
            args,
            vec![
                "--memory",
                "512m",
                "--cpus",
                "0.50",
                "--ulimit",
                "fsize=104857600:104857600",
                "--ulimit",
                "nofile=100:100",
            ]
        );
    }
}
