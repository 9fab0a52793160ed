// --- Persistence (SQLite) -------------------------------------------------
//
// One connection, one mutex. Every public operation on the catalog, queue,
// schedule and history takes the lock and runs inside a single transaction,
// so the HTTP handlers and the playout loop never observe a half-applied
// position shift or current-flag move.
//
// rusqlite is synchronous. Async callers go through `Store::run`, which hops
// onto the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::{PlayoutError, Result};

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS catalog (
                file_id          TEXT PRIMARY KEY,
                path             TEXT NOT NULL,
                size_bytes       INTEGER NOT NULL,
                duration_seconds INTEGER NOT NULL DEFAULT 0,
                probe_metadata   TEXT NOT NULL DEFAULT '{}',
                active           INTEGER NOT NULL DEFAULT 0,
                description      TEXT NOT NULL DEFAULT '',
                added_at         INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS queue_items (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id   TEXT NOT NULL REFERENCES catalog(file_id) ON DELETE CASCADE,
                added_at  INTEGER NOT NULL,
                played    INTEGER NOT NULL DEFAULT 0,
                played_at INTEGER,
                position  INTEGER NOT NULL DEFAULT 0,
                is_ad     INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_queue_items_pending
                ON queue_items(played, position, id);

            CREATE TABLE IF NOT EXISTS schedule (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id    TEXT NOT NULL UNIQUE REFERENCES catalog(file_id) ON DELETE CASCADE,
                position   INTEGER NOT NULL,
                is_current INTEGER NOT NULL DEFAULT 0,
                added_at   INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_schedule_position ON schedule(position);

            CREATE TABLE IF NOT EXISTS play_history (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id          TEXT NOT NULL,
                started_at       INTEGER NOT NULL,
                finished_at      INTEGER,
                duration_seconds INTEGER,
                is_ad            INTEGER NOT NULL DEFAULT 0,
                skipped          INTEGER NOT NULL DEFAULT 0,
                failure_reason   TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_play_history_started ON play_history(started_at DESC);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| PlayoutError::Internal("store lock poisoned".into()))?;
        f(&mut conn)
    }

    /// Same as `with_conn`, wrapped in a transaction that commits on `Ok`.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Run a blocking store operation from async code.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| PlayoutError::Internal(format!("store task failed: {e}")))?
    }
}

pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub fn rfc3339(unix: i64) -> Option<String> {
    time::OffsetDateTime::from_unix_timestamp(unix)
        .ok()?
        .format(&time::format_description::well_known::Rfc3339)
        .ok()
}

pub(crate) fn to_flag(b: bool) -> i64 {
    if b {
        1
    } else {
        0
    }
}
