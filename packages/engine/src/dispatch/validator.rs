// packages/engine/src/dispatch/validator.rs
//! Code safety validation
//!
//! The validator is a cheap synchronous predicate run before any pool work.
//! `PatternValidator` is a denylist; it is a first filter, not a sandbox.

use serde::{Deserialize, Serialize};

/// Verdict on a snippet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Accepted,
    Rejected(String),
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted)
    }
}

pub trait CodeValidator: Send + Sync {
    fn validate(&self, source: &str) -> Validation;
}

/// Accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl CodeValidator for AcceptAll {
    fn validate(&self, _source: &str) -> Validation {
        Validation::Accepted
    }
}

/// Validator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Substrings that reject a snippet (matched case-insensitively)
    pub denied_patterns: Vec<String>,

    /// Largest accepted snippet in bytes
    pub max_source_bytes: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            denied_patterns: [
                "import os",
                "import subprocess",
                "import sys",
                "__import__",
                "eval(",
                "exec(",
                "open(",
                "file(",
                "input(",
                "raw_input(",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            max_source_bytes: 100_000,
        }
    }
}

/// Rejects oversize snippets and snippets containing denied patterns
#[derive(Debug, Clone)]
pub struct PatternValidator {
    denied: Vec<(String, String)>,
    max_source_bytes: usize,
}

impl PatternValidator {
    pub fn new(config: &ValidatorConfig) -> Self {
        Self {
            denied: config
                .denied_patterns
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| (p.to_lowercase(), p.clone()))
                .collect(),
            max_source_bytes: config.max_source_bytes,
        }
    }
}

impl Default for PatternValidator {
    fn default() -> Self {
        Self::new(&ValidatorConfig::default())
    }
}

impl CodeValidator for PatternValidator {
    fn validate(&self, source: &str) -> Validation {
        if source.trim().is_empty() {
            return Validation::Rejected("no code provided".to_string());
        }

        if source.len() > self.max_source_bytes {
            return Validation::Rejected(format!(
                "code is {} bytes, limit is {}",
                source.len(),
                self.max_source_bytes
            ));
        }

        let lowered = source.to_lowercase();
        match self.denied.iter().find(|(needle, _)| lowered.contains(needle)) {
            Some((_, pattern)) => {
                Validation::Rejected(format!("forbidden pattern detected: {}", pattern))
            }
            None => Validation::Accepted,
        }
    }
}
