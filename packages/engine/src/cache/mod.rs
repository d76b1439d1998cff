// packages/engine/src/cache/mod.rs
//! Result cache
//!
//! - **Result Cache**: bounded in-memory LRU keyed by fingerprint, with an
//!   optional idle TTL
//! - **Disk Store**: optional compressed on-disk tier behind it
//! - **Stats**: hit/miss/eviction counters

pub mod disk;
pub mod result_cache;
pub mod stats;

pub use disk::{CompressionLevel, DiskStore, DEFAULT_DISK_CAPACITY_BYTES};
pub use result_cache::{CacheConfig, CachedResult, ResultCache, ENTRY_OVERHEAD_BYTES};
pub use stats::CacheStats;
