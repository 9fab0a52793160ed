// --- Catalog ----------------------------------------------------------------
//
// Durable record of every media file the channel knows about. Ids are
// content-addressed from the normalized absolute path, so rescanning the same
// directory after a restart lands on the same rows instead of duplicating them.

use std::path::{Component, Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::db::{to_flag, unix_now, Store};
use crate::error::{PlayoutError, Result};
use crate::probe::ProbeData;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CatalogEntry {
    pub id: String,
    pub path: String,
    pub size_bytes: i64,
    pub duration_seconds: i64,
    pub probe_metadata: serde_json::Value,
    pub active: bool,
    pub description: String,
    pub added_at: i64,
}

/// Absolute, lexically cleaned form of `path` (`.` and `..` removed).
///
/// This does not touch the filesystem, so ids can be derived for files that
/// have since disappeared.
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut out = PathBuf::new();
    for comp in abs.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// Catalog id for an already-normalized path.
pub fn file_id_for(normalized: &Path) -> String {
    let digest = Sha256::digest(normalized.to_string_lossy().as_bytes());
    format!("{digest:x}")
}

pub fn exists_on_disk(path: &str) -> bool {
    Path::new(path).is_file()
}

const COLUMNS: &str =
    "file_id, path, size_bytes, duration_seconds, probe_metadata, active, description, added_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CatalogEntry> {
    let meta: String = row.get(4)?;
    Ok(CatalogEntry {
        id: row.get(0)?,
        path: row.get(1)?,
        size_bytes: row.get(2)?,
        duration_seconds: row.get(3)?,
        probe_metadata: serde_json::from_str(&meta).unwrap_or_else(|_| serde_json::json!({})),
        active: row.get::<_, i64>(5)? != 0,
        description: row.get(6)?,
        added_at: row.get(7)?,
    })
}

pub(crate) fn lookup(conn: &Connection, id: &str) -> Result<Option<CatalogEntry>> {
    let sql = format!("SELECT {COLUMNS} FROM catalog WHERE file_id = ?1");
    Ok(conn.query_row(&sql, params![id], entry_from_row).optional()?)
}

/// Fails with `NotCataloged` unless `id` is a catalog row.
pub(crate) fn require(conn: &Connection, id: &str) -> Result<CatalogEntry> {
    lookup(conn, id)?.ok_or_else(|| PlayoutError::NotCataloged(id.to_string()))
}

pub struct Catalog<'a> {
    store: &'a Store,
}

impl Store {
    pub fn catalog(&self) -> Catalog<'_> {
        Catalog { store: self }
    }
}

impl Catalog<'_> {
    /// Register a file (or return the existing row). `probe` only runs for
    /// files seen for the first time.
    pub fn register(
        &self,
        path: &Path,
        probe: impl FnOnce(&Path) -> ProbeData,
    ) -> Result<CatalogEntry> {
        let normalized = normalize_path(path)?;
        let id = file_id_for(&normalized);

        if let Some(existing) = self.get(&id)? {
            return Ok(existing);
        }

        let meta = std::fs::metadata(&normalized)
            .map_err(|_| PlayoutError::FileMissing(normalized.display().to_string()))?;
        if !meta.is_file() {
            return Err(PlayoutError::InvalidInput(format!(
                "not a regular file: {}",
                normalized.display()
            )));
        }

        // Probing can take a while (ffprobe subprocess); do it outside the lock.
        let probed = probe(&normalized);
        let entry = CatalogEntry {
            id: id.clone(),
            path: normalized.to_string_lossy().to_string(),
            size_bytes: meta.len() as i64,
            duration_seconds: probed.duration_seconds,
            probe_metadata: probed.json,
            active: false,
            description: String::new(),
            added_at: unix_now(),
        };

        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO catalog
                    (file_id, path, size_bytes, duration_seconds, probe_metadata, active, description, added_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id,
                    entry.path,
                    entry.size_bytes,
                    entry.duration_seconds,
                    entry.probe_metadata.to_string(),
                    to_flag(entry.active),
                    entry.description,
                    entry.added_at
                ],
            )?;
            Ok(())
        })?;

        info!(
            file_id = %entry.id,
            path = %entry.path,
            duration_seconds = entry.duration_seconds,
            size_bytes = entry.size_bytes,
            "file added to catalog"
        );
        // Re-read so a concurrent registration of the same path wins consistently.
        self.get(&id)?.ok_or_else(|| PlayoutError::NotFound(id))
    }

    pub fn get(&self, id: &str) -> Result<Option<CatalogEntry>> {
        self.store.with_conn(|conn| lookup(conn, id))
    }

    /// Catalog id for a filesystem path, if that file is cataloged.
    pub fn id_for_path(&self, path: &Path) -> Result<String> {
        let id = file_id_for(&normalize_path(path)?);
        match self.get(&id)? {
            Some(_) => Ok(id),
            None => Err(PlayoutError::NotCataloged(id)),
        }
    }

    /// All entries in insertion order.
    pub fn list(&self) -> Result<Vec<CatalogEntry>> {
        self.store.with_conn(|conn| {
            let sql = format!("SELECT {COLUMNS} FROM catalog ORDER BY added_at ASC, rowid ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], entry_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        self.update_one(
            id,
            "UPDATE catalog SET active = ?2 WHERE file_id = ?1",
            &to_flag(active),
        )
    }

    pub fn set_description(&self, id: &str, description: &str) -> Result<()> {
        self.update_one(
            id,
            "UPDATE catalog SET description = ?2 WHERE file_id = ?1",
            &description,
        )
    }

    pub fn update_probe(&self, id: &str, probed: &ProbeData) -> Result<()> {
        let n = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE catalog SET probe_metadata = ?2, duration_seconds = ?3 WHERE file_id = ?1",
                params![id, probed.json.to_string(), probed.duration_seconds],
            )?)
        })?;
        if n == 0 {
            return Err(PlayoutError::NotFound(format!("catalog entry {id}")));
        }
        Ok(())
    }

    fn update_one(&self, id: &str, sql: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
        let n = self
            .store
            .with_conn(|conn| Ok(conn.execute(sql, params![id, value])?))?;
        if n == 0 {
            return Err(PlayoutError::NotFound(format!("catalog entry {id}")));
        }
        Ok(())
    }

    /// Delete a catalog row, cascading to the queue and the schedule.
    ///
    /// The schedule ring is re-packed so positions stay dense. The file on
    /// disk is left alone.
    pub fn delete(&self, id: &str) -> Result<CatalogEntry> {
        let entry = self.store.with_tx(|tx| {
            let entry = lookup(tx, id)?
                .ok_or_else(|| PlayoutError::NotFound(format!("catalog entry {id}")))?;

            let removed_position: Option<i64> = tx
                .query_row(
                    "SELECT position FROM schedule WHERE file_id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(pos) = removed_position {
                tx.execute("DELETE FROM schedule WHERE file_id = ?1", params![id])?;
                tx.execute(
                    "UPDATE schedule SET position = position - 1 WHERE position > ?1",
                    params![pos],
                )?;
            }
            tx.execute("DELETE FROM queue_items WHERE file_id = ?1", params![id])?;
            tx.execute("DELETE FROM catalog WHERE file_id = ?1", params![id])?;
            Ok(entry)
        })?;

        if !exists_on_disk(&entry.path) {
            warn!(file_id = %id, path = %entry.path, "deleted catalog entry whose file was already gone");
        } else {
            info!(file_id = %id, path = %entry.path, "catalog entry deleted");
        }
        Ok(entry)
    }
}
