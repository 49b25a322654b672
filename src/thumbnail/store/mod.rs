//! Thumbnail cache storage
//!
//! Two interchangeable backends sit behind [`ThumbnailStore`]:
//! - `DiskStore` keeps payload files under a sharded cache directory and
//!   records them in a SQLite catalog (`catalog.rs`)
//! - `MemoryStore` keeps payloads in a bounded in-process cache
//!
//! Entries are immutable once written. A changed source produces a new key,
//! so staleness never needs explicit invalidation. Reclaiming stale entries
//! only frees space.

mod catalog;
mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use super::{Payload, ThumbnailKey};
use crate::config::{CacheBackend, EngineConfig};
use crate::error::CacheResult;

/// A cached thumbnail and its bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: ThumbnailKey,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn new(key: ThumbnailKey, payload: Payload, created_at: DateTime<Utc>) -> Self {
        let size_bytes = payload.len() as u64;
        Self {
            key,
            payload,
            created_at,
            size_bytes,
        }
    }

    /// Weak HTTP validator derived from creation time and size
    pub fn etag(&self) -> String {
        let nanos = self
            .created_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.created_at.timestamp());
        format!("W/\"{:x}-{:x}\"", nanos, self.size_bytes)
    }
}

/// Totals across the whole store
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUsage {
    pub entries: u64,
    pub total_bytes: u64,
}

/// Outcome of a stale-entry sweep
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub examined: u64,
    pub removed: u64,
    pub bytes_freed: u64,
}

/// Key to encoded-bytes storage shared by all workers.
///
/// `get` must tolerate many concurrent readers and `put` concurrent writers
/// on disjoint keys. Same-key writes never race: the engine runs at most
/// one job per key.
pub trait ThumbnailStore: Send + Sync + 'static {
    /// Look up a key. Never triggers generation.
    fn get(&self, key: &ThumbnailKey) -> CacheResult<Option<CacheEntry>>;

    /// Store a payload. Rewriting identical bytes is a no-op. Different
    /// bytes for an existing key fail with `CacheError::WriteConflict`.
    fn put(&self, key: &ThumbnailKey, payload: Payload) -> CacheResult<CacheEntry>;

    fn usage(&self) -> CacheResult<CacheUsage>;

    /// Drop entries whose source file is gone or has been modified since
    fn reclaim_stale(&self) -> CacheResult<ReclaimReport>;
}

/// Open the store selected by `config`
pub fn open_store(config: &EngineConfig) -> CacheResult<Arc<dyn ThumbnailStore>> {
    Ok(match config.cache_backend {
        CacheBackend::Disk => Arc::new(DiskStore::open(&config.cache_dir, config.format)?),
        CacheBackend::Memory { capacity_bytes } => Arc::new(MemoryStore::new(capacity_bytes)),
    })
}

/// True when the source no longer exists or carries a different modify time
pub(crate) fn source_is_stale(source: &Path, recorded: DateTime<Utc>) -> bool {
    match std::fs::metadata(source).and_then(|meta| meta.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified) != recorded,
        Err(_) => true,
    }
}
