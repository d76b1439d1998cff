// packages/engine/src/dispatch/request.rs
//! Render requests and fingerprints

use crate::dispatch::display::DisplaySize;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use ulid::Ulid;

/// SHA-256 of the normalized source; the cache key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(normalized: &str) -> Self {
        Self(Sha256::digest(normalized.as_bytes()).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// First 12 hex chars, for logs
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Opaque identity of whoever submitted a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmitterId(String);

impl SubmitterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Turns raw source into the text that gets fingerprinted
pub trait CodeNormalizer: Send + Sync {
    fn normalize(&self, source: &str) -> String;
}

/// Trims the snippet, unifies line endings and strips trailing whitespace
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimNormalizer;

impl CodeNormalizer for TrimNormalizer {
    fn normalize(&self, source: &str) -> String {
        source
            .replace("\r\n", "\n")
            .replace('\r', "\n")
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

/// One request to render a snippet
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub id: Ulid,
    /// Source as submitted
    pub source_code: String,
    /// Normalized source; this is what gets fingerprinted and executed
    pub normalized_code: String,
    pub submitter_id: SubmitterId,
    pub requested_at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub display: DisplaySize,
}

impl RenderRequest {
    /// Build a request with the default normalizer
    pub fn new(source_code: impl Into<String>, submitter_id: SubmitterId, max_display: DisplaySize) -> Self {
        Self::with_normalizer(source_code, submitter_id, max_display, &TrimNormalizer)
    }

    pub fn with_normalizer(
        source_code: impl Into<String>,
        submitter_id: SubmitterId,
        max_display: DisplaySize,
        normalizer: &dyn CodeNormalizer,
    ) -> Self {
        let source_code = source_code.into();
        let normalized_code = normalizer.normalize(&source_code);
        let fingerprint = Fingerprint::of(&normalized_code);
        let display = DisplaySize::for_source(&source_code, max_display);

        Self {
            id: Ulid::new(),
            source_code,
            normalized_code,
            submitter_id,
            requested_at: Utc::now(),
            fingerprint,
            display,
        }
    }
}
