//! Error types for the indexing and thumbnail engine.
//!
//! Each concern gets its own enum so callers can match on exactly the
//! failures they are able to handle.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Failures of a directory listing or path resolution.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The requested path escapes the configured root
    #[error("invalid path: {0}")]
    InvalidPath(PathBuf),

    #[error("path not found: {0}")]
    NotFound(PathBuf),

    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl IndexError {
    /// Classify an I/O error raised while touching `path`.
    pub fn from_io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::NotFound => IndexError::NotFound(path),
            io::ErrorKind::PermissionDenied => IndexError::PermissionDenied(path),
            _ => IndexError::Io { path, source: err },
        }
    }
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Failures of a thumbnail request.
///
/// One job result fans out to every waiter on that key, so this type is
/// `Clone` and carries only owned, cheap data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThumbnailError {
    #[error("source image not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid path: {0}")]
    InvalidPath(PathBuf),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("failed to encode thumbnail for {path}: {reason}")]
    Encode { path: PathBuf, reason: String },

    #[error("thumbnail generation for {path} exceeded {budget:?}")]
    Timeout { path: PathBuf, budget: Duration },

    #[error("thumbnail job was cancelled")]
    Cancelled,

    /// The generation task panicked or was aborted
    #[error("thumbnail worker lost: {0}")]
    WorkerLost(String),

    #[error("thumbnail engine is shutting down")]
    ShuttingDown,
}

impl From<IndexError> for ThumbnailError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::InvalidPath(path) => ThumbnailError::InvalidPath(path),
            IndexError::NotFound(path) => ThumbnailError::NotFound(path),
            IndexError::PermissionDenied(path) => ThumbnailError::Decode {
                path,
                reason: "permission denied".to_string(),
            },
            IndexError::Io { path, source } => ThumbnailError::Decode {
                path,
                reason: source.to_string(),
            },
        }
    }
}

pub type ThumbnailResult<T> = std::result::Result<T, ThumbnailError>;

/// Failures of the thumbnail cache store.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A different payload was written for a key that already has one.
    /// Keys are content-stable, so this points at a key-construction bug.
    #[error("conflicting payload written for cache key {key}")]
    WriteConflict { key: String },

    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cache catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Failures while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Failures while assembling an engine from configuration.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid project root: {0}")]
    Index(#[from] IndexError),

    #[error("failed to open thumbnail cache: {0}")]
    Cache(#[from] CacheError),
}
