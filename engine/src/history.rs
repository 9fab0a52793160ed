// --- Play history -----------------------------------------------------------
//
// Append-only ledger. A record is opened when bytes start flowing and closed
// exactly once; the `finished_at IS NULL` guard makes a second finish a no-op.

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

use crate::db::{to_flag, unix_now, Store};
use crate::error::{PlayoutError, Result};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryRecord {
    pub id: i64,
    pub catalog_id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub is_ad: bool,
    pub skipped: bool,
    pub failure_reason: Option<String>,
}

/// How a play attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finish {
    Completed,
    Skipped,
    Failed(String),
    Stopped,
}

impl Finish {
    fn skipped(&self) -> bool {
        matches!(self, Finish::Skipped | Finish::Failed(_))
    }

    fn failure_reason(&self) -> Option<&str> {
        match self {
            Finish::Failed(reason) => Some(reason),
            Finish::Stopped => Some("stopped"),
            Finish::Completed | Finish::Skipped => None,
        }
    }
}

const COLUMNS: &str =
    "id, file_id, started_at, finished_at, duration_seconds, is_ad, skipped, failure_reason";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get(0)?,
        catalog_id: row.get(1)?,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        duration_seconds: row.get(4)?,
        is_ad: row.get::<_, i64>(5)? != 0,
        skipped: row.get::<_, i64>(6)? != 0,
        failure_reason: row.get(7)?,
    })
}

pub struct History<'a> {
    store: &'a Store,
}

impl Store {
    pub fn history(&self) -> History<'_> {
        History { store: self }
    }
}

impl History<'_> {
    pub fn start(&self, catalog_id: &str, is_ad: bool, started_at: i64) -> Result<HistoryRecord> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO play_history (file_id, started_at, is_ad) VALUES (?1, ?2, ?3)",
                params![catalog_id, started_at, to_flag(is_ad)],
            )?;
            let id = conn.last_insert_rowid();
            debug!(history_id = id, file_id = %catalog_id, "history record opened");
            Ok(HistoryRecord {
                id,
                catalog_id: catalog_id.to_string(),
                started_at,
                finished_at: None,
                duration_seconds: None,
                is_ad,
                skipped: false,
                failure_reason: None,
            })
        })
    }

    /// Close a record. Returns `false` when it was already finalized.
    pub fn finish(&self, id: i64, how: &Finish) -> Result<bool> {
        let now = unix_now();
        self.store.with_tx(|tx| {
            let started_at: i64 = tx
                .query_row(
                    "SELECT started_at FROM play_history WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()?
                .ok_or_else(|| PlayoutError::NotFound(format!("history record {id}")))?;

            let n = tx.execute(
                "UPDATE play_history
                 SET finished_at = ?2, duration_seconds = ?3, skipped = ?4, failure_reason = ?5
                 WHERE id = ?1 AND finished_at IS NULL",
                params![
                    id,
                    now,
                    (now - started_at).max(0),
                    to_flag(how.skipped()),
                    how.failure_reason()
                ],
            )?;
            debug!(history_id = id, outcome = ?how, finalized = n == 1, "history record closed");
            Ok(n == 1)
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<HistoryRecord>> {
        self.store.with_conn(|conn| {
            let sql = format!("SELECT {COLUMNS} FROM play_history WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], record_from_row).optional()?)
        })
    }

    /// Most recent plays first.
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        self.store.with_conn(|conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM play_history ORDER BY started_at DESC, id DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![limit as i64], record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
