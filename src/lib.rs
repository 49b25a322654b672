//! Directory indexing and prioritized background thumbnail generation for
//! wafer-map image viewers.
//!
//! - [`index`] lists folders under a fixed project root
//! - [`thumbnail`] turns source images into cached thumbnails, deduplicating
//!   concurrent requests over a fixed pool of workers

pub mod config;
pub mod error;
pub mod index;
pub mod thumbnail;

pub use config::{CacheBackend, EngineConfig};
pub use error::{CacheError, ConfigError, IndexError, SetupError, ThumbnailError};
pub use index::{DirectoryIndex, EntryKind, IndexEntry, SortOrder};
pub use thumbnail::store::{CacheEntry, DiskStore, MemoryStore, ThumbnailStore};
pub use thumbnail::{Payload, Priority, ThumbnailEngine, ThumbnailKey};
