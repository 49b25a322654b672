//! Directory index
//!
//! Stateless scanner over a configured root. Every call re-reads the
//! filesystem; listings are never cached.

mod entry;
mod scan;

pub use entry::{sort_entries, EntryKind, IndexEntry, SortOrder};
pub use scan::{is_supported_image, ImageFile, SUPPORTED_EXTENSIONS};

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, trace};

use crate::error::{IndexError, IndexResult};

/// Lists directories under a fixed root
#[derive(Debug, Clone)]
pub struct DirectoryIndex {
    /// Canonical root; every resolved path must start with it
    root: PathBuf,
    order: SortOrder,
    skip_dirs: HashSet<String>,
}

impl DirectoryIndex {
    /// Create an index over `root`, which must exist.
    pub fn new<I, S>(root: impl AsRef<Path>, order: SortOrder, skip_dirs: I) -> IndexResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let root = root.as_ref();
        let root = fs::canonicalize(root).map_err(|e| IndexError::from_io(root, e))?;

        Ok(Self {
            root,
            order,
            skip_dirs: skip_dirs.into_iter().map(Into::into).collect(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    /// Resolve a root-relative request path to a canonical absolute path.
    ///
    /// Leading separators are ignored, so "/lot1" and "lot1" name the same
    /// directory. An empty path is the root itself. Anything that climbs
    /// above the root, lexically or through a symlink, is `InvalidPath`.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> IndexResult<PathBuf> {
        let relative = relative.as_ref();

        let mut lexical = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => lexical.push(part),
                Component::ParentDir => {
                    if !lexical.pop() {
                        return Err(IndexError::InvalidPath(relative.to_path_buf()));
                    }
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }

        let joined = self.root.join(&lexical);
        let resolved = fs::canonicalize(&joined).map_err(|e| IndexError::from_io(&joined, e))?;

        if !resolved.starts_with(&self.root) {
            debug!("Rejected path escaping root: {}", relative.display());
            return Err(IndexError::InvalidPath(relative.to_path_buf()));
        }

        Ok(resolved)
    }

    /// List the immediate children of a directory.
    ///
    /// Directory-level failures are returned. Children whose metadata cannot
    /// be read are left out, so the listing is best-effort.
    pub fn list(&self, relative: impl AsRef<Path>) -> IndexResult<Vec<IndexEntry>> {
        let dir = self.resolve(relative)?;

        let metadata = fs::metadata(&dir).map_err(|e| IndexError::from_io(&dir, e))?;
        if !metadata.is_dir() {
            return Err(IndexError::NotFound(dir));
        }

        let read_dir = fs::read_dir(&dir).map_err(|e| IndexError::from_io(&dir, e))?;

        let mut entries = Vec::new();
        for child in read_dir {
            let child = match child {
                Ok(child) => child,
                Err(e) => {
                    trace!("Skipping unreadable entry in {}: {e}", dir.display());
                    continue;
                }
            };

            let name = child.file_name().to_string_lossy().into_owned();
            if self.is_hidden(&name) {
                continue;
            }

            // Follows symlinks; broken links fall out here
            let child_path = child.path();
            let Ok(child_meta) = fs::metadata(&child_path) else {
                trace!("Skipping {}: metadata unavailable", child_path.display());
                continue;
            };

            if let Some(entry) = IndexEntry::from_metadata(name, &child_meta) {
                entries.push(entry);
            }
        }

        sort_entries(&mut entries, self.order);
        Ok(entries)
    }

    /// Dot-files, `__pycache__` and configured skip directories never show up
    pub(crate) fn is_hidden(&self, name: &str) -> bool {
        name.starts_with('.') || name == "__pycache__" || self.skip_dirs.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, DirectoryIndex) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::create_dir(root.join("Lot_B")).unwrap();
        fs::create_dir(root.join("lot_a")).unwrap();
        fs::create_dir(root.join("thumbnails")).unwrap();
        fs::create_dir(root.join(".git")).unwrap();
        fs::write(root.join("wafer_02.png"), b"12345").unwrap();
        fs::write(root.join("Wafer_01.png"), b"1").unwrap();
        File::create(root.join(".hidden")).unwrap();

        let index = DirectoryIndex::new(root, SortOrder::Ascending, ["thumbnails"]).unwrap();
        (dir, index)
    }

    fn names(entries: &[IndexEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn lists_directories_then_files_and_hides_skipped() {
        let (_dir, index) = fixture();
        let entries = index.list("").unwrap();

        assert_eq!(names(&entries), vec!["lot_a", "Lot_B", "Wafer_01.png", "wafer_02.png"]);
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].size_bytes, None);
        assert_eq!(entries[3].size_bytes, Some(5));
    }

    #[test]
    fn repeated_listing_is_stable() {
        let (_dir, index) = fixture();
        let first = index.list("/").unwrap();
        for _ in 0..5 {
            assert_eq!(index.list("/").unwrap(), first);
        }
    }

    #[test]
    fn listing_reflects_changes_immediately() {
        let (dir, index) = fixture();
        assert_eq!(index.list("lot_a").unwrap().len(), 0);

        fs::write(dir.path().join("lot_a").join("new.png"), b"x").unwrap();
        assert_eq!(names(&index.list("lot_a").unwrap()), vec!["new.png"]);
    }

    #[test]
    fn leading_separator_is_relative_to_root() {
        let (dir, index) = fixture();
        let resolved = index.resolve("/lot_a").unwrap();
        assert_eq!(resolved, fs::canonicalize(dir.path().join("lot_a")).unwrap());
    }

    #[test]
    fn traversal_outside_root_is_rejected() {
        let (_dir, index) = fixture();
        assert!(matches!(index.list("../"), Err(IndexError::InvalidPath(_))));
        assert!(matches!(
            index.list("lot_a/../../etc"),
            Err(IndexError::InvalidPath(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_root_is_rejected() {
        let (dir, index) = fixture();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        assert!(matches!(index.list("escape"), Err(IndexError::InvalidPath(_))));
    }

    #[cfg(unix)]
    #[test]
    fn broken_symlinks_are_left_out_of_listings() {
        let (dir, index) = fixture();
        std::os::unix::fs::symlink(dir.path().join("nowhere.png"), dir.path().join("dangling.png")).unwrap();

        let entries = index.list("").unwrap();
        assert_eq!(names(&entries), vec!["lot_a", "Lot_B", "Wafer_01.png", "wafer_02.png"]);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_is_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, index) = fixture();
        let locked = dir.path().join("lot_a");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users read through mode bits; nothing to observe then
        let bypassed = fs::read_dir(&locked).is_ok();
        let result = index.list("lot_a");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        if !bypassed {
            assert!(matches!(result, Err(IndexError::PermissionDenied(_))), "got {result:?}");
        }
    }

    #[test]
    fn missing_directory_and_files_are_not_found() {
        let (_dir, index) = fixture();
        assert!(matches!(index.list("nope"), Err(IndexError::NotFound(_))));
        assert!(matches!(index.list("wafer_02.png"), Err(IndexError::NotFound(_))));
    }

    #[test]
    fn descending_order_applies_per_kind() {
        let (dir, _) = fixture();
        let index = DirectoryIndex::new(dir.path(), SortOrder::Descending, ["thumbnails"]).unwrap();
        let entries = index.list("").unwrap();
        assert_eq!(names(&entries), vec!["Lot_B", "lot_a", "wafer_02.png", "Wafer_01.png"]);
    }
}
