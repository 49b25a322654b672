use chrono::Utc;
use moka::sync::Cache;
use tracing::{error, info};

use super::{source_is_stale, CacheEntry, CacheUsage, ReclaimReport, ThumbnailStore};
use crate::error::{CacheError, CacheResult};
use crate::thumbnail::{Payload, ThumbnailKey};

/// Bounded in-process thumbnail cache, weighted by payload size.
///
/// Eviction only drops the cache's own reference: payloads are reference
/// counted, so a waiter holding one keeps it alive after eviction.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    cache: Cache<ThumbnailKey, CacheEntry>,
}

impl MemoryStore {
    pub fn new(capacity_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity_bytes.max(1))
            .weigher(|_key, entry: &CacheEntry| {
                u32::try_from(entry.size_bytes).unwrap_or(u32::MAX)
            })
            .build();
        Self { cache }
    }
}

impl ThumbnailStore for MemoryStore {
    fn get(&self, key: &ThumbnailKey) -> CacheResult<Option<CacheEntry>> {
        Ok(self.cache.get(key))
    }

    fn put(&self, key: &ThumbnailKey, payload: Payload) -> CacheResult<CacheEntry> {
        if let Some(existing) = self.cache.get(key) {
            if existing.payload == payload {
                return Ok(existing);
            }
            error!("Refusing to overwrite cached thumbnail for {key} with different bytes");
            return Err(CacheError::WriteConflict { key: key.encode() });
        }

        let entry = CacheEntry::new(key.clone(), payload, Utc::now());
        self.cache.insert(key.clone(), entry.clone());
        Ok(entry)
    }

    fn usage(&self) -> CacheResult<CacheUsage> {
        self.cache.run_pending_tasks();
        Ok(CacheUsage {
            entries: self.cache.entry_count(),
            total_bytes: self.cache.weighted_size(),
        })
    }

    fn reclaim_stale(&self) -> CacheResult<ReclaimReport> {
        let mut report = ReclaimReport::default();

        let stale: Vec<(ThumbnailKey, u64)> = self
            .cache
            .iter()
            .inspect(|_| report.examined += 1)
            .filter(|(key, _)| source_is_stale(&key.source_path, key.source_modified_at))
            .map(|(key, entry)| ((*key).clone(), entry.size_bytes))
            .collect();

        for (key, size) in stale {
            self.cache.invalidate(&key);
            report.removed += 1;
            report.bytes_freed += size;
        }

        if report.removed > 0 {
            info!(
                "Reclaimed {} stale in-memory thumbnails ({} bytes)",
                report.removed, report.bytes_freed
            );
        }

        Ok(report)
    }
}
