// packages/engine/src/cache/disk.rs
//! Persistent cache tier
//!
//! One zstd-compressed file per fingerprint, so cached renders survive a
//! restart. The memory cache stays authoritative; this tier is consulted on
//! a memory miss and promoted back into memory on a hit.
//!
//! The directory is held to a byte budget. When a write pushes it over, the
//! oldest-written entries are deleted until it fits again.
//!
//! # File layout (before compression)
//!
//! ```text
//! ┌──────────────┬─────────────────────┬──────────────────┐
//! │ meta_len u32 │ meta (JSON, UTF-8)  │ raw image bytes  │
//! │ big-endian   │ status, detail, ... │ (may be empty)   │
//! └──────────────┴─────────────────────┴──────────────────┘
//! ```

use crate::cache::result_cache::CachedResult;
use crate::dispatch::request::Fingerprint;
use crate::dispatch::result::{RenderResult, RenderStatus};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const FILE_EXTENSION: &str = "rpc";

/// Default byte budget for the directory (1 GiB)
pub const DEFAULT_DISK_CAPACITY_BYTES: u64 = 1024 * 1024 * 1024;

/// Compression levels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// Fast compression (level 1); images are mostly compressed already
    #[default]
    Fast,

    /// Balanced (level 3)
    Balanced,

    /// Best compression (level 19)
    Best,
}

impl CompressionLevel {
    pub fn as_i32(&self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
            CompressionLevel::Best => 19,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DiskMeta {
    status: RenderStatus,
    error_detail: Option<String>,
    duration_ms: u64,
    stored_at: DateTime<Utc>,
    has_image: bool,
}

/// One entry file found on disk
struct StoredFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Directory of compressed cache entries
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
    level: CompressionLevel,
    capacity_bytes: u64,
    /// Upper-bound estimate of the directory size; exact after each sweep
    resident_bytes: Arc<AtomicU64>,
    /// Serializes sweeps
    sweep: Arc<Mutex<()>>,
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `dir`
    ///
    /// Leftover temporary files from an interrupted write are removed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            EngineError::StorageFailed(format!("Failed to create {:?}: {}", dir, e))
        })?;

        let store = Self {
            dir,
            level: CompressionLevel::default(),
            capacity_bytes: DEFAULT_DISK_CAPACITY_BYTES,
            resident_bytes: Arc::new(AtomicU64::new(0)),
            sweep: Arc::new(Mutex::new(())),
        };
        let files = store.scan().await?;
        let resident: u64 = files.iter().map(|f| f.size).sum();
        store.resident_bytes.store(resident, Ordering::SeqCst);

        info!(
            "Disk cache at {:?} ({} entries, {} bytes)",
            store.dir,
            files.len(),
            resident
        );
        Ok(store)
    }

    pub fn with_level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Byte budget for the directory; applied on the next write or
    /// `enforce_capacity`
    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Current size of all entries on disk
    pub async fn resident_bytes(&self) -> Result<u64> {
        Ok(self.scan().await?.iter().map(|f| f.size).sum())
    }

    /// Delete oldest entries until the directory fits its budget; returns
    /// how many were deleted
    pub async fn enforce_capacity(&self) -> Result<usize> {
        self.evict(None).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir
            .join(format!("{}.{}", fingerprint.to_hex(), FILE_EXTENSION))
    }

    /// Persist a result
    pub async fn save(&self, fingerprint: &Fingerprint, cached: &CachedResult) -> Result<()> {
        let encoded = encode(cached)?;
        let level = self.level.as_i32();

        let compressed = tokio::task::spawn_blocking(move || zstd::encode_all(&encoded[..], level))
            .await
            .map_err(|e| EngineError::CompressionFailed(format!("Compression task failed: {}", e)))?
            .map_err(|e| EngineError::CompressionFailed(format!("Compression error: {}", e)))?;

        let path = self.path_for(fingerprint);
        let tmp = path.with_extension(format!("{}.tmp", FILE_EXTENSION));

        fs::write(&tmp, &compressed).await.map_err(|e| {
            EngineError::StorageFailed(format!("Failed to write {:?}: {}", tmp, e))
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            EngineError::StorageFailed(format!("Failed to move {:?} into place: {}", path, e))
        })?;

        debug!(
            "Stored {} on disk ({} bytes compressed)",
            fingerprint.short(),
            compressed.len()
        );

        let resident = self
            .resident_bytes
            .fetch_add(compressed.len() as u64, Ordering::SeqCst)
            + compressed.len() as u64;
        if resident > self.capacity_bytes {
            self.evict(Some(&path)).await?;
        }
        Ok(())
    }

    /// Delete oldest-written entries until the directory fits, sparing
    /// `keep` unless it alone exceeds the budget
    async fn evict(&self, keep: Option<&Path>) -> Result<usize> {
        let _guard = self.sweep.lock().await;

        let mut files = self.scan().await?;
        let mut resident: u64 = files.iter().map(|f| f.size).sum();
        files.sort_by_key(|f| f.modified);

        let (spared, candidates): (Vec<StoredFile>, Vec<StoredFile>) = files
            .into_iter()
            .partition(|f| keep.map_or(false, |keep| f.path == keep));

        let mut removed = 0;
        for file in candidates.iter().chain(spared.iter()) {
            if resident <= self.capacity_bytes {
                break;
            }
            match fs::remove_file(&file.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(EngineError::StorageFailed(format!(
                        "Failed to evict {:?}: {}",
                        file.path, e
                    )))
                }
            }
            resident = resident.saturating_sub(file.size);
            removed += 1;
        }

        self.resident_bytes.store(resident, Ordering::SeqCst);
        if removed > 0 {
            info!(
                "Evicted {} disk cache entries ({} of {} bytes used)",
                removed, resident, self.capacity_bytes
            );
        }
        Ok(removed)
    }

    /// List entry files, removing stale temporaries along the way
    async fn scan(&self) -> Result<Vec<StoredFile>> {
        let storage_err =
            |e: std::io::Error| EngineError::StorageFailed(format!("Failed to scan {:?}: {}", self.dir, e));

        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.map_err(storage_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(storage_err)? {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.ends_with(".tmp") {
                // A recent temporary may belong to a write in flight
                if is_stale(&entry).await {
                    let _ = fs::remove_file(&path).await;
                }
                continue;
            }
            if path.extension().map_or(true, |ext| ext != FILE_EXTENSION) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Removed concurrently
                Err(_) => continue,
            };
            files.push(StoredFile {
                path,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(files)
    }

    /// Load a result, deleting it if older than `max_age` or unreadable
    pub async fn load(
        &self,
        fingerprint: &Fingerprint,
        max_age: Option<Duration>,
    ) -> Result<Option<CachedResult>> {
        let path = self.path_for(fingerprint);
        let compressed = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EngineError::StorageFailed(format!(
                    "Failed to read {:?}: {}",
                    path, e
                )))
            }
        };

        let decoded = tokio::task::spawn_blocking(move || zstd::decode_all(&compressed[..]))
            .await
            .map_err(|e| EngineError::CompressionFailed(format!("Decompression task failed: {}", e)))?;

        let cached = match decoded.map_err(|e| e.to_string()).and_then(|raw| decode(&raw)) {
            Ok(cached) => cached,
            Err(reason) => {
                warn!("Dropping unreadable disk cache entry {:?}: {}", path, reason);
                self.remove(fingerprint).await?;
                return Ok(None);
            }
        };

        if let Some(max_age) = max_age {
            let age = Utc::now()
                .signed_duration_since(cached.stored_at)
                .to_std()
                .unwrap_or_default();
            if age > max_age {
                debug!("Disk cache entry {} expired", fingerprint.short());
                self.remove(fingerprint).await?;
                return Ok(None);
            }
        }

        Ok(Some(cached))
    }

    pub async fn remove(&self, fingerprint: &Fingerprint) -> Result<()> {
        match fs::remove_file(self.path_for(fingerprint)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::StorageFailed(format!(
                "Failed to remove cache entry: {}",
                e
            ))),
        }
    }
}

async fn is_stale(entry: &fs::DirEntry) -> bool {
    const STALE_AFTER: Duration = Duration::from_secs(300);
    match entry.metadata().await.and_then(|m| m.modified()) {
        Ok(modified) => modified.elapsed().map_or(false, |age| age > STALE_AFTER),
        Err(_) => false,
    }
}

fn encode(cached: &CachedResult) -> Result<Vec<u8>> {
    let result = &cached.result;
    let meta = DiskMeta {
        status: result.status,
        error_detail: result.error_detail.clone(),
        duration_ms: result.duration.as_millis() as u64,
        stored_at: cached.stored_at,
        has_image: result.image_bytes.is_some(),
    };
    let meta = serde_json::to_vec(&meta)
        .map_err(|e| EngineError::StorageFailed(format!("Failed to encode metadata: {}", e)))?;
    let meta_len = u32::try_from(meta.len())
        .map_err(|_| EngineError::StorageFailed("Metadata too large".to_string()))?;

    let image = result.image_bytes.as_deref().unwrap_or_default();
    let mut buf = Vec::with_capacity(4 + meta.len() + image.len());
    buf.extend_from_slice(&meta_len.to_be_bytes());
    buf.extend_from_slice(&meta);
    buf.extend_from_slice(image);
    Ok(buf)
}

fn decode(raw: &[u8]) -> std::result::Result<CachedResult, String> {
    let header: [u8; 4] = raw
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or("truncated header")?;
    let meta_len = u32::from_be_bytes(header) as usize;
    let meta_end = 4usize
        .checked_add(meta_len)
        .filter(|end| *end <= raw.len())
        .ok_or("truncated metadata")?;

    let meta: DiskMeta =
        serde_json::from_slice(&raw[4..meta_end]).map_err(|e| format!("bad metadata: {}", e))?;

    let image = &raw[meta_end..];
    Ok(CachedResult {
        result: RenderResult {
            status: meta.status,
            image_bytes: meta.has_image.then(|| Bytes::copy_from_slice(image)),
            error_detail: meta.error_detail,
            duration: Duration::from_millis(meta.duration_ms),
        },
        stored_at: meta.stored_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cached(result: RenderResult) -> CachedResult {
        CachedResult {
            result,
            stored_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_image() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path().join("cache")).await.unwrap();
        let fp = Fingerprint::of("print('hi')");

        let entry = cached(RenderResult::success(
            Bytes::from_static(b"\x89PNG\r\n\x1a\nrest"),
            Duration::from_millis(1234),
        ));
        store.save(&fp, &entry).await.unwrap();

        let loaded = store.load(&fp, None).await.unwrap().unwrap();
        assert_eq!(loaded.result, entry.result);
        assert_eq!(loaded.stored_at.timestamp_millis(), entry.stored_at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_save_and_load_error() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        let fp = Fingerprint::of("raise x");

        let entry = cached(RenderResult::failure(
            RenderStatus::RuntimeError,
            "NameError: name 'x' is not defined",
            Duration::from_millis(80),
        ));
        store.save(&fp, &entry).await.unwrap();

        let loaded = store.load(&fp, None).await.unwrap().unwrap();
        assert_eq!(loaded.result.status, RenderStatus::RuntimeError);
        assert!(loaded.result.image_bytes.is_none());
        assert_eq!(loaded.result.error_detail, entry.result.error_detail);
    }

    #[tokio::test]
    async fn test_missing_entry() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        assert!(store.load(&Fingerprint::of("nope"), None).await.unwrap().is_none());
        store.remove(&Fingerprint::of("nope")).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_entry_deleted() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        let fp = Fingerprint::of("old");

        let entry = CachedResult {
            result: RenderResult::success(Bytes::from_static(b"img"), Duration::ZERO),
            stored_at: Utc::now() - chrono::Duration::hours(2),
        };
        store.save(&fp, &entry).await.unwrap();

        assert!(store
            .load(&fp, Some(Duration::from_secs(3600)))
            .await
            .unwrap()
            .is_none());
        assert!(!store.path_for(&fp).exists());
    }

    #[tokio::test]
    async fn test_corrupt_entry_dropped() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        let fp = Fingerprint::of("corrupt");

        fs::write(store.path_for(&fp), b"not zstd at all").await.unwrap();
        assert!(store.load(&fp, None).await.unwrap().is_none());
        assert!(!store.path_for(&fp).exists());
    }

    /// Incompressible image of `len` bytes
    fn noise(len: usize, seed: u64) -> Bytes {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect::<Vec<u8>>()
            .into()
    }

    #[tokio::test]
    async fn test_directory_stays_within_budget() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap().with_capacity(10_000);

        let mut last = None;
        for i in 0..6 {
            let fp = Fingerprint::of(&format!("snippet {}", i));
            let entry = cached(RenderResult::success(noise(4000, i), Duration::ZERO));
            store.save(&fp, &entry).await.unwrap();
            assert!(store.resident_bytes().await.unwrap() <= 10_000);
            last = Some(fp);
        }

        // The newest entry survives its own write
        let last = last.unwrap();
        assert!(store.load(&last, None).await.unwrap().is_some());
        assert!(store.load(&Fingerprint::of("snippet 0"), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_entry_not_kept() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap().with_capacity(1_000);
        let fp = Fingerprint::of("huge");

        let entry = cached(RenderResult::success(noise(5000, 7), Duration::ZERO));
        store.save(&fp, &entry).await.unwrap();

        assert_eq!(store.resident_bytes().await.unwrap(), 0);
        assert!(store.load(&fp, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reopen_applies_budget() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        for i in 0..4 {
            let entry = cached(RenderResult::success(noise(4000, i), Duration::ZERO));
            store
                .save(&Fingerprint::of(&format!("entry {}", i)), &entry)
                .await
                .unwrap();
        }

        let reopened = DiskStore::open(dir.path()).await.unwrap().with_capacity(9_000);
        let removed = reopened.enforce_capacity().await.unwrap();
        assert!(removed >= 2);
        assert!(reopened.resident_bytes().await.unwrap() <= 9_000);
    }

    #[tokio::test]
    async fn test_scan_ignores_fresh_temporaries() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        let tmp = dir.path().join("abc.rpc.tmp");
        fs::write(&tmp, b"in flight").await.unwrap();

        assert_eq!(store.resident_bytes().await.unwrap(), 0);
        assert!(tmp.exists());
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(decode(&[0, 0]).is_err());
        assert!(decode(&[0, 0, 0, 200, b'{']).is_err());
    }
}
