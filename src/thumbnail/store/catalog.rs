use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Result as SqlResult, Row};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::thumbnail::ThumbnailKey;

/// One cached thumbnail as recorded in the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRow {
    /// Hex digest of the key, also the payload file stem
    pub digest: String,
    pub key: ThumbnailKey,
    /// Payload file path relative to the cache directory
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// The Catalog manages the SQLite database next to the payload files.
/// It stores which key produced each payload file, so stale entries can be
/// found without decoding file names.
pub struct Catalog {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Catalog {
    /// Open or create the catalog at `db_path`
    pub fn open(db_path: &Path) -> SqlResult<Self> {
        let conn = Connection::open(db_path)?;
        debug!("Thumbnail catalog opened at: {}", db_path.display());

        let catalog = Catalog {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };
        catalog.init_schema()?;

        Ok(catalog)
    }

    /// Create the table and indexes if they don't exist
    fn init_schema(&self) -> SqlResult<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS thumbnails (
                digest              TEXT PRIMARY KEY,
                source_path         TEXT NOT NULL,
                source_mtime_secs   INTEGER NOT NULL,
                source_mtime_nanos  INTEGER NOT NULL,
                width               INTEGER NOT NULL,
                height              INTEGER NOT NULL,
                file_name           TEXT NOT NULL,
                created_at          INTEGER NOT NULL,
                size_bytes          INTEGER NOT NULL
            )",
            [],
        )?;

        // Lookups by source when a folder's thumbnails are inspected
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_thumbnails_source
             ON thumbnails(source_path)",
            [],
        )?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Record a freshly written payload. An existing row for the same
    /// digest is kept as is, entries are immutable.
    pub fn record(&self, row: &CatalogRow) -> SqlResult<()> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO thumbnails
                (digest, source_path, source_mtime_secs, source_mtime_nanos,
                 width, height, file_name, created_at, size_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.digest,
                row.key.source_path.to_string_lossy(),
                row.key.source_modified_at.timestamp(),
                row.key.source_modified_at.timestamp_subsec_nanos(),
                row.key.width,
                row.key.height,
                row.file_name,
                row.created_at.timestamp_millis(),
                row.size_bytes as i64,
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn find(&self, digest: &str) -> SqlResult<Option<CatalogRow>> {
        self.conn
            .lock()
            .query_row(
                "SELECT digest, source_path, source_mtime_secs, source_mtime_nanos,
                        width, height, file_name, created_at, size_bytes
                 FROM thumbnails WHERE digest = ?1",
                [digest],
                row_to_entry,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
    }

    /// Get every row, oldest first
    pub fn all(&self) -> SqlResult<Vec<CatalogRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT digest, source_path, source_mtime_secs, source_mtime_nanos,
                    width, height, file_name, created_at, size_bytes
             FROM thumbnails ORDER BY created_at ASC",
        )?;

        let rows = stmt
            .query_map([], row_to_entry)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn remove(&self, digest: &str) -> SqlResult<bool> {
        let changed = self
            .conn
            .lock()
            .execute("DELETE FROM thumbnails WHERE digest = ?1", [digest])?;
        Ok(changed > 0)
    }

    /// Number of rows and sum of their payload sizes
    pub fn totals(&self) -> SqlResult<(u64, u64)> {
        let (count, bytes): (i64, i64) = self.conn.lock().query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM thumbnails",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count.max(0) as u64, bytes.max(0) as u64))
    }

    /// Drop rows whose payload file no longer exists under `cache_dir`.
    /// The next request for such a key simply regenerates it.
    pub fn verify(&self, cache_dir: &Path) -> SqlResult<usize> {
        let mut removed = 0;
        for row in self.all()? {
            if !cache_dir.join(&row.file_name).exists() && self.remove(&row.digest)? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Dropped {} catalog rows with missing payload files", removed);
        }

        Ok(removed)
    }
}

fn row_to_entry(row: &Row<'_>) -> SqlResult<CatalogRow> {
    let source_path: String = row.get(1)?;
    let mtime_secs: i64 = row.get(2)?;
    let mtime_nanos: u32 = row.get(3)?;
    let created_millis: i64 = row.get(7)?;
    let size_bytes: i64 = row.get(8)?;

    let source_modified_at = Utc
        .timestamp_opt(mtime_secs, mtime_nanos)
        .single()
        .unwrap_or_default();
    let created_at = Utc
        .timestamp_millis_opt(created_millis)
        .single()
        .unwrap_or_default();

    Ok(CatalogRow {
        digest: row.get(0)?,
        key: ThumbnailKey::new(source_path, source_modified_at, row.get(4)?, row.get(5)?),
        file_name: row.get(6)?,
        created_at,
        size_bytes: size_bytes.max(0) as u64,
    })
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("db_path", &self.db_path)
            .finish()
    }
}
