//! Listing data structures
//!
//! These are produced fresh on every listing call and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::Metadata;
use std::str::FromStr;

/// Kind of a listed child. Directories order before files.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

/// A single child of a listed directory
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// File name only (e.g., "lot_0001.png")
    pub name: String,
    pub kind: EntryKind,
    pub modified_at: DateTime<Utc>,
    /// Size in bytes, files only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl IndexEntry {
    /// Build an entry from filesystem metadata.
    /// Returns None when the platform cannot report a modify time.
    pub fn from_metadata(name: String, metadata: &Metadata) -> Option<Self> {
        let modified_at = DateTime::<Utc>::from(metadata.modified().ok()?);

        let (kind, size_bytes) = if metadata.is_dir() {
            (EntryKind::Directory, None)
        } else {
            (EntryKind::File, Some(metadata.len()))
        };

        Some(Self {
            name,
            kind,
            modified_at,
            size_bytes,
        })
    }
}

/// Direction of the case-insensitive name ordering inside each kind
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Ascending),
            "desc" | "descending" => Ok(SortOrder::Descending),
            other => Err(format!("unknown sort order {other:?}")),
        }
    }
}

/// Sort a listing: directories first, then files, each by case-insensitive
/// name in `order`. Names equal ignoring case fall back to a byte-wise
/// comparison so the result never depends on enumeration order.
pub fn sort_entries(entries: &mut [IndexEntry], order: SortOrder) {
    entries.sort_by(|a, b| {
        a.kind.cmp(&b.kind).then_with(|| {
            let by_name = compare_names(&a.name, &b.name);
            match order {
                SortOrder::Ascending => by_name,
                SortOrder::Descending => by_name.reverse(),
            }
        })
    });
}

fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
