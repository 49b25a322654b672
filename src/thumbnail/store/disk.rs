use chrono::{DateTime, Utc};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, trace, warn};

use super::catalog::{Catalog, CatalogRow};
use super::{source_is_stale, CacheEntry, CacheUsage, ReclaimReport, ThumbnailStore};
use crate::error::{CacheError, CacheResult};
use crate::thumbnail::{Payload, ThumbnailFormat, ThumbnailKey};

const CATALOG_FILE_NAME: &str = "catalog.db";

/// Filesystem-backed thumbnail cache.
///
/// Layout:
/// <cache_dir>/
/// ├── catalog.db
/// └── <digest>[0..2]/     # sharding
///     └── <digest>.<ext>
#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
    extension: &'static str,
    catalog: Catalog,
}

impl DiskStore {
    /// Open the cache directory, creating it and its catalog if needed
    pub fn open(dir: &Path, format: ThumbnailFormat) -> CacheResult<Self> {
        fs::create_dir_all(dir)?;
        let catalog = Catalog::open(&dir.join(CATALOG_FILE_NAME))?;

        debug!("Thumbnail cache at {} (catalog {})", dir.display(), catalog.path().display());
        Ok(Self {
            dir: dir.to_path_buf(),
            extension: format.extension(),
            catalog,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Digest naming this store's payload for `key`. The encoding is part
    /// of the input, so a format change never collides with older rows.
    fn digest(&self, key: &ThumbnailKey) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(key.encode().as_bytes());
        hasher.update(b"|");
        hasher.update(self.extension.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// True when a catalog file name was written in this store's format
    fn is_current_format(&self, file_name: &str) -> bool {
        Path::new(file_name)
            .extension()
            .is_some_and(|ext| ext == self.extension)
    }

    /// Payload path relative to the cache directory.
    /// This does not check if the file exists.
    fn file_name(&self, digest: &str) -> String {
        format!("{}/{digest}.{}", &digest[..2], self.extension)
    }

    /// Drop catalog rows whose payload file has disappeared
    pub fn verify(&self) -> CacheResult<usize> {
        Ok(self.catalog.verify(&self.dir)?)
    }

    fn read_entry(&self, key: &ThumbnailKey, path: &Path) -> io::Result<Option<CacheEntry>> {
        let payload = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let created_at = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(CacheEntry::new(key.clone(), payload.into(), created_at)))
    }
}

impl ThumbnailStore for DiskStore {
    fn get(&self, key: &ThumbnailKey) -> CacheResult<Option<CacheEntry>> {
        let path = self.dir.join(self.file_name(&self.digest(key)));
        Ok(self.read_entry(key, &path)?)
    }

    fn put(&self, key: &ThumbnailKey, payload: Payload) -> CacheResult<CacheEntry> {
        let digest = self.digest(key);
        let file_name = self.file_name(&digest);
        let path = self.dir.join(&file_name);

        if let Some(existing) = self.read_entry(key, &path)? {
            if existing.payload == payload {
                trace!("Identical payload already cached for {key}");
                return Ok(existing);
            }
            error!(
                "Refusing to overwrite cached thumbnail for {key} with different bytes \
                 ({} cached vs {} new); cache keys are not content-stable",
                existing.size_bytes,
                payload.len()
            );
            return Err(CacheError::WriteConflict { key: key.encode() });
        }

        // Write to a temp file in the shard and rename, so readers never see
        // a partially written payload
        let shard = path.parent().unwrap_or(&self.dir);
        fs::create_dir_all(shard)?;
        let mut tmp = NamedTempFile::new_in(shard)?;
        tmp.write_all(&payload)?;
        tmp.persist(&path).map_err(|e| CacheError::Io(e.error))?;

        let entry = CacheEntry::new(key.clone(), payload, Utc::now());
        self.catalog.record(&CatalogRow {
            digest,
            key: key.clone(),
            file_name,
            created_at: entry.created_at,
            size_bytes: entry.size_bytes,
        })?;

        trace!("Cached thumbnail: {}", path.display());
        Ok(entry)
    }

    fn usage(&self) -> CacheResult<CacheUsage> {
        let (entries, total_bytes) = self.catalog.totals()?;
        Ok(CacheUsage {
            entries,
            total_bytes,
        })
    }

    fn reclaim_stale(&self) -> CacheResult<ReclaimReport> {
        let mut report = ReclaimReport::default();

        for row in self.catalog.all()? {
            report.examined += 1;
            // Payloads in a previous format can no longer be served
            if self.is_current_format(&row.file_name)
                && !source_is_stale(&row.key.source_path, row.key.source_modified_at)
            {
                continue;
            }

            let path = self.dir.join(&row.file_name);
            match fs::remove_file(&path) {
                Ok(()) => report.bytes_freed += row.size_bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove stale thumbnail {}: {e}", path.display());
                    continue;
                }
            }
            self.catalog.remove(&row.digest)?;
            report.removed += 1;

            // Empty shard directories are left behind by removals
            if let Some(shard) = path.parent() {
                let _ = fs::remove_dir(shard);
            }
        }

        if report.removed > 0 {
            info!(
                "Reclaimed {} stale thumbnails ({} bytes)",
                report.removed, report.bytes_freed
            );
        }

        Ok(report)
    }
}
