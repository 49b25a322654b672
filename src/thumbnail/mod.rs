//! Thumbnail generation engine
//!
//! This module handles:
//! - Cache keys that invalidate themselves when the source changes
//! - Decoding, resizing and re-encoding source images
//! - Caching encoded thumbnails on disk or in memory
//! - Deduplicating and prioritizing generation jobs over a fixed worker pool

mod engine;
mod generate;
mod queue;
mod stats;
pub mod store;

pub use engine::{PoolOptions, PrewarmReport, ThumbnailEngine, Ticket};
pub use generate::{placeholder, Generator, ImageGenerator, ThumbnailFormat};
pub use queue::JobQueue;
pub use stats::EngineStats;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Encoded thumbnail bytes, shared between the store and every waiter
pub type Payload = Arc<[u8]>;

/// Who is waiting for a thumbnail
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// A user is looking at the grid right now
    Interactive,
    /// Speculative pre-warming, best effort
    Background,
}

/// Identity of one thumbnail result.
///
/// The source modify time is part of the key, so replacing the source file
/// produces a new key and a cache miss without any explicit eviction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThumbnailKey {
    /// Normalized absolute path of the source image
    pub source_path: PathBuf,
    pub source_modified_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
}

impl ThumbnailKey {
    pub fn new(
        source_path: impl Into<PathBuf>,
        source_modified_at: DateTime<Utc>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            source_modified_at,
            width,
            height,
        }
    }

    /// Build a key from already-fetched source metadata
    pub fn from_metadata(
        source_path: impl Into<PathBuf>,
        metadata: &Metadata,
        width: u32,
        height: u32,
    ) -> io::Result<Self> {
        let modified = DateTime::<Utc>::from(metadata.modified()?);
        Ok(Self::new(source_path, modified, width, height))
    }

    /// Stat the source and build a key for its current contents
    pub fn for_source(source_path: &Path, width: u32, height: u32) -> io::Result<Self> {
        let source_path = std::fs::canonicalize(source_path)?;
        let metadata = std::fs::metadata(&source_path)?;
        Self::from_metadata(source_path, &metadata, width, height)
    }

    /// Deterministic text encoding of all four key fields
    pub fn encode(&self) -> String {
        format!(
            "{}|{}.{:09}|{}x{}",
            self.source_path.display(),
            self.source_modified_at.timestamp(),
            self.source_modified_at.timestamp_subsec_nanos(),
            self.width,
            self.height
        )
    }

    /// Hex digest of [`ThumbnailKey::encode`], used for file names
    pub fn digest(&self) -> String {
        blake3::hash(self.encode().as_bytes()).to_hex().to_string()
    }
}

impl fmt::Display for ThumbnailKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}x{}",
            self.source_path.display(),
            self.width,
            self.height
        )
    }
}
