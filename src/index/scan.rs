//! Recursive image discovery, used to feed background pre-warming

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

use super::DirectoryIndex;
use crate::error::{IndexError, IndexResult};

/// Image extensions the generator accepts (compared case-insensitively)
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp", "gif"];

/// Check if a path has a supported image extension
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

/// An image found beneath a scanned folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    /// Canonical absolute path
    pub path: PathBuf,
    /// Path relative to the index root, with forward slashes
    pub relative: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

impl DirectoryIndex {
    /// Walk a folder tree and collect every supported image.
    ///
    /// Hidden and skipped directories are pruned. Unreadable entries are
    /// dropped the same way `list` drops them. Results come back sorted by
    /// path so repeated scans of an unchanged tree are identical.
    pub fn scan_images(&self, relative: impl AsRef<Path>) -> IndexResult<Vec<ImageFile>> {
        let start = self.resolve(relative)?;

        let metadata = fs::metadata(&start).map_err(|e| IndexError::from_io(&start, e))?;
        if !metadata.is_dir() {
            return Err(IndexError::NotFound(start));
        }

        let mut images = Vec::new();

        // Walk the directory tree recursively
        let walker = WalkDir::new(&start)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !self.is_hidden(&entry.file_name().to_string_lossy())
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    trace!("Skipping unreadable entry during scan: {e}");
                    continue;
                }
            };

            // Only process files (not directories)
            if !entry.file_type().is_file() || !is_supported_image(entry.path()) {
                continue;
            }

            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            let Ok(relative) = entry.path().strip_prefix(self.root()) else {
                continue;
            };

            images.push(ImageFile {
                path: entry.path().to_path_buf(),
                relative: relative.to_string_lossy().replace('\\', "/"),
                size_bytes: meta.len(),
                modified_at: DateTime::<Utc>::from(modified),
            });
        }

        debug!("Scanned {}: {} images", start.display(), images.len());
        Ok(images)
    }
}
