// packages/engine/src/cache/result_cache.rs
//! In-memory result cache with LRU eviction
//!
//! Reads take only a shard read lock: recency is refreshed through atomics,
//! not by moving entries. Mutations (insert, evict, expire) serialize on a
//! single writer lock so the resident-size accounting never races.
//!
//! ```text
//! get ──► shard read ──► idle TTL check ──► touch (tick, time) ──► clone
//! put ──► writer lock ──► drop old ──► purge expired ──► evict min(tick, seq) ──► insert
//! ```

use crate::cache::stats::{CacheCounters, CacheStats};
use crate::dispatch::request::Fingerprint;
use crate::dispatch::result::RenderResult;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Bookkeeping charged to every entry on top of its payload
pub const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Cache configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Upper bound on resident bytes
    pub capacity_bytes: usize,

    /// Entries not read for this long are dropped (None = never)
    pub max_age: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024,
            max_age: None,
        }
    }
}

struct CacheEntry {
    result: RenderResult,
    stored_at: DateTime<Utc>,
    size_bytes: usize,
    inserted_seq: u64,
    /// Logical clock value of the last touch
    last_tick: AtomicU64,
    /// Nanoseconds since the cache epoch of the last touch
    last_access_nanos: AtomicU64,
}

/// A cached result and when it was stored
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub result: RenderResult,
    pub stored_at: DateTime<Utc>,
}

/// Bounded fingerprint → result cache
pub struct ResultCache {
    config: CacheConfig,
    entries: DashMap<Fingerprint, CacheEntry>,
    writer: Mutex<()>,
    resident: AtomicUsize,
    clock: AtomicU64,
    epoch: Instant,
    counters: CacheCounters,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            writer: Mutex::new(()),
            resident: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            epoch: Instant::now(),
            counters: CacheCounters::default(),
        }
    }

    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self::new(CacheConfig {
            capacity_bytes,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Accounted size of `result` in the cache
    pub fn entry_size(result: &RenderResult) -> usize {
        result.size_bytes() + ENTRY_OVERHEAD_BYTES
    }

    /// Look up a result, refreshing its recency
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<RenderResult> {
        self.get_entry(fingerprint).map(|cached| cached.result)
    }

    /// Look up a result along with its store time
    pub fn get_entry(&self, fingerprint: &Fingerprint) -> Option<CachedResult> {
        let now = self.now_nanos();

        let expired_seq = match self.entries.get(fingerprint) {
            None => {
                self.counters.record_miss();
                return None;
            }
            Some(entry) => {
                if self.is_expired(&entry, now) {
                    entry.inserted_seq
                } else {
                    entry.last_tick.store(self.tick(), Ordering::Relaxed);
                    entry.last_access_nanos.store(now, Ordering::Relaxed);
                    self.counters.record_hit();
                    return Some(CachedResult {
                        result: entry.result.clone(),
                        stored_at: entry.stored_at,
                    });
                }
            }
        };

        {
            let _writer = self.writer.lock();
            // Only drop the entry we judged expired, not a fresh replacement
            if let Some((_, entry)) = self
                .entries
                .remove_if(fingerprint, |_, e| e.inserted_seq == expired_seq)
            {
                self.resident.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                self.counters.record_expiration();
                debug!("Expired cache entry {}", fingerprint.short());
            }
        }

        self.counters.record_miss();
        None
    }

    /// Insert or overwrite, evicting least-recently-used entries as needed
    ///
    /// Returns `false` if the result alone exceeds the capacity and was not
    /// stored.
    pub fn put(&self, fingerprint: Fingerprint, result: RenderResult) -> bool {
        self.put_at(fingerprint, result, Utc::now())
    }

    /// Like [`put`](Self::put), keeping an existing store time
    pub fn put_at(&self, fingerprint: Fingerprint, result: RenderResult, stored_at: DateTime<Utc>) -> bool {
        let size = Self::entry_size(&result);
        let capacity = self.config.capacity_bytes;

        if size > capacity {
            self.counters.record_rejection();
            debug!(
                "Not caching {}: {} bytes exceeds capacity {}",
                fingerprint.short(),
                size,
                capacity
            );
            return false;
        }

        let _writer = self.writer.lock();

        if let Some((_, old)) = self.entries.remove(&fingerprint) {
            self.resident.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }

        if self.resident.load(Ordering::Relaxed) + size > capacity {
            self.purge_expired_locked();
        }

        while self.resident.load(Ordering::Relaxed) + size > capacity {
            let victim = self
                .entries
                .iter()
                .min_by_key(|e| (e.last_tick.load(Ordering::Relaxed), e.inserted_seq))
                .map(|e| *e.key());

            let Some(victim) = victim else {
                break;
            };

            if let Some((_, evicted)) = self.entries.remove(&victim) {
                self.resident.fetch_sub(evicted.size_bytes, Ordering::Relaxed);
                self.counters.record_eviction();
                debug!("Evicted cache entry {} ({} bytes)", victim.short(), evicted.size_bytes);
            }
        }

        let tick = self.tick();
        self.entries.insert(
            fingerprint,
            CacheEntry {
                result,
                stored_at,
                size_bytes: size,
                inserted_seq: tick,
                last_tick: AtomicU64::new(tick),
                last_access_nanos: AtomicU64::new(self.now_nanos()),
            },
        );
        self.resident.fetch_add(size, Ordering::Relaxed);
        self.counters.record_insertion();
        true
    }

    /// Drop every entry past its idle TTL; returns how many
    pub fn purge_expired(&self) -> usize {
        let _writer = self.writer.lock();
        self.purge_expired_locked()
    }

    fn purge_expired_locked(&self) -> usize {
        if self.config.max_age.is_none() {
            return 0;
        }

        let now = self.now_nanos();
        let expired: Vec<(Fingerprint, u64)> = self
            .entries
            .iter()
            .filter(|e| self.is_expired(e.value(), now))
            .map(|e| (*e.key(), e.inserted_seq))
            .collect();

        let mut purged = 0;
        for (fingerprint, seq) in expired {
            if let Some((_, entry)) = self
                .entries
                .remove_if(&fingerprint, |_, e| e.inserted_seq == seq)
            {
                self.resident.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                self.counters.record_expiration();
                purged += 1;
            }
        }
        purged
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resident bytes, including per-entry overhead
    pub fn resident_bytes(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let _writer = self.writer.lock();
        self.entries.clear();
        self.resident.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot(
            self.entries.len(),
            self.resident_bytes(),
            self.config.capacity_bytes,
        )
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn now_nanos(&self) -> u64 {
        Instant::now().duration_since(self.epoch).as_nanos() as u64
    }

    fn is_expired(&self, entry: &CacheEntry, now: u64) -> bool {
        match self.config.max_age {
            Some(max_age) => {
                let idle = now.saturating_sub(entry.last_access_nanos.load(Ordering::Relaxed));
                idle > max_age.as_nanos() as u64
            }
            None => false,
        }
    }
}
