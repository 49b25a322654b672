//! Engine configuration.
//!
//! Values come from an optional JSON file, then environment variables
//! override individual fields. Anything left unset falls back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::index::SortOrder;
use crate::thumbnail::ThumbnailFormat;

/// Where generated thumbnails are kept
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CacheBackend {
    /// Sharded files under `cache_dir` plus a SQLite catalog
    Disk,
    /// Bounded in-process cache, weighted by payload bytes
    Memory { capacity_bytes: u64 },
}

/// All tunables of the indexing and thumbnail engine
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory that every listing and thumbnail path must stay inside
    pub root: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_backend: CacheBackend,
    /// Number of generation workers (static for the engine's lifetime)
    pub workers: usize,
    /// Default edge length of the square thumbnail box
    pub thumbnail_size: u32,
    pub format: ThumbnailFormat,
    /// JPEG quality, 1..=100
    pub quality: u8,
    /// Wall-clock budget for a single generation
    pub job_timeout_secs: u64,
    pub listing_order: SortOrder,
    /// Directory names hidden from listings and scans
    pub skip_dirs: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            cache_dir: default_cache_dir(),
            cache_backend: CacheBackend::Disk,
            workers: 4,
            thumbnail_size: 512,
            format: ThumbnailFormat::Webp,
            quality: 90,
            job_timeout_secs: 30,
            listing_order: SortOrder::Descending,
            skip_dirs: vec!["classification".to_string(), "thumbnails".to_string()],
        }
    }
}

/// Default thumbnail cache location.
/// Returns ~/.cache/waferview/thumbnails on Linux
pub fn default_cache_dir() -> PathBuf {
    let mut path = dirs::cache_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir);

    path.push("waferview");
    path.push("thumbnails");
    path
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from the process environment
    pub fn apply_env(self) -> ConfigResult<Self> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Override fields from an arbitrary variable lookup.
    pub fn apply_vars<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("PROJECT_ROOT") {
            self.root = PathBuf::from(root);
        }
        if let Some(dir) = lookup("THUMBNAIL_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("THUMBNAIL_SIZE") {
            self.thumbnail_size = parse_number("THUMBNAIL_SIZE", &size)?;
        }
        if let Some(format) = lookup("THUMBNAIL_FORMAT") {
            self.format = format.parse().map_err(|reason| ConfigError::InvalidValue {
                field: "THUMBNAIL_FORMAT",
                reason,
            })?;
        }
        if let Some(quality) = lookup("THUMBNAIL_QUALITY") {
            self.quality = parse_number("THUMBNAIL_QUALITY", &quality)?;
        }
        if let Some(workers) = lookup("THUMBNAIL_WORKERS") {
            self.workers = parse_number("THUMBNAIL_WORKERS", &workers)?;
        }
        if let Some(secs) = lookup("THUMBNAIL_TIMEOUT_SECS") {
            self.job_timeout_secs = parse_number("THUMBNAIL_TIMEOUT_SECS", &secs)?;
        }
        if let Some(order) = lookup("LISTING_ORDER") {
            self.listing_order = order.parse().map_err(|reason| ConfigError::InvalidValue {
                field: "LISTING_ORDER",
                reason,
            })?;
        }
        if let Some(skip) = lookup("SKIP_DIRS") {
            self.skip_dirs = skip
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(self)
    }

    /// Reject values the engine cannot run with.
    /// A worker count of zero is clamped rather than rejected.
    pub fn validate(mut self) -> ConfigResult<Self> {
        if self.thumbnail_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "thumbnail_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(1..=100).contains(&self.quality) {
            return Err(ConfigError::InvalidValue {
                field: "quality",
                reason: format!("{} is outside 1..=100", self.quality),
            });
        }
        if self.job_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "job_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if let CacheBackend::Memory { capacity_bytes: 0 } = self.cache_backend {
            return Err(ConfigError::InvalidValue {
                field: "cache_backend",
                reason: "memory capacity must be greater than zero".to_string(),
            });
        }
        self.workers = self.workers.max(1);

        Ok(self)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, raw: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            field,
            reason: format!("{raw:?}: {e}"),
        })
}
