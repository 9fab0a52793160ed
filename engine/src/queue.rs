// --- Queue ------------------------------------------------------------------
//
// FIFO of items waiting to play "now". Order is (position, id). Regular items
// append at max(position)+1; ads jump the line at position 0 and push every
// pending item back by one. Items are never deleted by playback, only flipped
// to played, so the table doubles as a short-term log until clear_played().

use std::path::Path;

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog;
use crate::db::{to_flag, unix_now, Store};
use crate::error::{PlayoutError, Result};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueItem {
    pub id: i64,
    pub catalog_id: String,
    pub added_at: i64,
    pub played: bool,
    pub played_at: Option<i64>,
    pub position: i64,
    pub is_ad: bool,
}

const COLUMNS: &str = "id, file_id, added_at, played, played_at, position, is_ad";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        id: row.get(0)?,
        catalog_id: row.get(1)?,
        added_at: row.get(2)?,
        played: row.get::<_, i64>(3)? != 0,
        played_at: row.get(4)?,
        position: row.get(5)?,
        is_ad: row.get::<_, i64>(6)? != 0,
    })
}

pub struct Queue<'a> {
    store: &'a Store,
}

impl Store {
    pub fn queue(&self) -> Queue<'_> {
        Queue { store: self }
    }
}

impl Queue<'_> {
    pub fn enqueue(&self, catalog_id: &str, is_ad: bool) -> Result<QueueItem> {
        let item = self.store.with_tx(|tx| {
            catalog::require(tx, catalog_id)?;

            let position = if is_ad {
                tx.execute(
                    "UPDATE queue_items SET position = position + 1 WHERE played = 0",
                    [],
                )?;
                0
            } else {
                let max: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(position), 0) FROM queue_items",
                    [],
                    |r| r.get(0),
                )?;
                max + 1
            };

            tx.execute(
                "INSERT INTO queue_items (file_id, added_at, played, position, is_ad)
                 VALUES (?1, ?2, 0, ?3, ?4)",
                params![catalog_id, unix_now(), position, to_flag(is_ad)],
            )?;
            let id = tx.last_insert_rowid();
            let sql = format!("SELECT {COLUMNS} FROM queue_items WHERE id = ?1");
            Ok(tx.query_row(&sql, params![id], item_from_row)?)
        })?;

        info!(
            queue_id = item.id,
            file_id = %item.catalog_id,
            position = item.position,
            is_ad = item.is_ad,
            "item queued"
        );
        Ok(item)
    }

    /// Normalize `path`, resolve it to a catalog id and enqueue it.
    pub fn enqueue_path(&self, path: &Path, is_ad: bool) -> Result<QueueItem> {
        let id = self.store.catalog().id_for_path(path)?;
        self.enqueue(&id, is_ad)
    }

    pub fn next_pending(&self) -> Result<Option<QueueItem>> {
        self.store.with_conn(|conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM queue_items WHERE played = 0 ORDER BY position ASC, id ASC LIMIT 1"
            );
            Ok(conn.query_row(&sql, [], item_from_row).optional()?)
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<QueueItem>> {
        self.store.with_conn(|conn| {
            let sql = format!("SELECT {COLUMNS} FROM queue_items WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], item_from_row).optional()?)
        })
    }

    /// Flip an item to played. Already-played items keep their original
    /// `played_at`.
    pub fn mark_played(&self, id: i64) -> Result<()> {
        let n = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE queue_items
                 SET played_at = CASE WHEN played = 0 THEN ?2 ELSE played_at END,
                     played = 1
                 WHERE id = ?1",
                params![id, unix_now()],
            )?)
        })?;
        if n == 0 {
            return Err(PlayoutError::NotFound(format!("queue item {id}")));
        }
        debug!(queue_id = id, "queue item marked played");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<QueueItem>> {
        self.store.with_conn(|conn| {
            let sql = format!("SELECT {COLUMNS} FROM queue_items ORDER BY position ASC, id ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], item_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn pending_count(&self) -> Result<i64> {
        self.store.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM queue_items WHERE played = 0",
                [],
                |r| r.get(0),
            )?)
        })
    }

    pub fn clear_played(&self) -> Result<usize> {
        let n = self
            .store
            .with_conn(|conn| Ok(conn.execute("DELETE FROM queue_items WHERE played = 1", [])?))?;
        info!(deleted_count = n, "played items cleared from queue");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::cataloged_file;

    #[test]
    fn enqueue_requires_a_catalog_entry() {
        let store = Store::open_in_memory().unwrap();
        let err = store.queue().enqueue("deadbeef", false).unwrap_err();
        assert_eq!(err.reason(), "not_cataloged");
        assert!(store.queue().list().unwrap().is_empty());
    }

    #[test]
    fn regular_items_append_in_fifo_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let a = cataloged_file(&store, dir.path(), "a.ts", 4);
        let b = cataloged_file(&store, dir.path(), "b.ts", 4);

        let qa = store.queue().enqueue(&a.id, false).unwrap();
        let qb = store.queue().enqueue(&b.id, false).unwrap();
        assert!(qa.position < qb.position);
        assert_eq!(store.queue().next_pending().unwrap().unwrap().id, qa.id);
    }

    #[test]
    fn ad_jumps_to_the_front() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let a = cataloged_file(&store, dir.path(), "item1.ts", 4);
        let b = cataloged_file(&store, dir.path(), "item2.ts", 4);
        let ad = cataloged_file(&store, dir.path(), "ad.ts", 4);

        let q1 = store.queue().enqueue(&a.id, false).unwrap();
        let q2 = store.queue().enqueue(&b.id, false).unwrap();
        let qad = store.queue().enqueue(&ad.id, true).unwrap();

        assert_eq!(qad.position, 0);
        assert!(qad.is_ad);
        let order: Vec<i64> = store.queue().list().unwrap().iter().map(|i| i.id).collect();
        assert_eq!(order, vec![qad.id, q1.id, q2.id]);
        assert_eq!(store.queue().next_pending().unwrap().unwrap().id, qad.id);
    }

    #[test]
    fn ad_shift_leaves_played_rows_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let a = cataloged_file(&store, dir.path(), "a.ts", 4);
        let ad = cataloged_file(&store, dir.path(), "ad.ts", 4);

        let done = store.queue().enqueue(&a.id, false).unwrap();
        store.queue().mark_played(done.id).unwrap();
        store.queue().enqueue(&ad.id, true).unwrap();

        let done_after = store.queue().get(done.id).unwrap().unwrap();
        assert_eq!(done_after.position, done.position);
    }

    #[test]
    fn ties_break_by_insertion_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let a = cataloged_file(&store, dir.path(), "a.ts", 4);
        let first = store.queue().enqueue(&a.id, false).unwrap();
        let second = store.queue().enqueue(&a.id, false).unwrap();
        store
            .with_conn(|conn| {
                conn.execute("UPDATE queue_items SET position = 7", [])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.queue().next_pending().unwrap().unwrap().id, first.id);
        store.queue().mark_played(first.id).unwrap();
        assert_eq!(store.queue().next_pending().unwrap().unwrap().id, second.id);
    }

    #[test]
    fn mark_played_sets_timestamp_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let a = cataloged_file(&store, dir.path(), "a.ts", 4);
        let q = store.queue().enqueue(&a.id, false).unwrap();

        store.queue().mark_played(q.id).unwrap();
        let first = store.queue().get(q.id).unwrap().unwrap();
        assert!(first.played);
        assert!(first.played_at.is_some());

        store.queue().mark_played(q.id).unwrap();
        assert_eq!(store.queue().get(q.id).unwrap().unwrap().played_at, first.played_at);
        assert!(store.queue().next_pending().unwrap().is_none());

        assert_eq!(store.queue().mark_played(9999).unwrap_err().reason(), "not_found");
    }

    #[test]
    fn clear_played_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let a = cataloged_file(&store, dir.path(), "a.ts", 4);
        let done = store.queue().enqueue(&a.id, false).unwrap();
        let pending = store.queue().enqueue(&a.id, false).unwrap();
        store.queue().mark_played(done.id).unwrap();

        assert_eq!(store.queue().clear_played().unwrap(), 1);
        assert_eq!(store.queue().clear_played().unwrap(), 0);

        let left = store.queue().list().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, pending.id);
        assert!(!left[0].played);
    }

    #[test]
    fn enqueue_path_resolves_through_the_catalog() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let a = cataloged_file(&store, dir.path(), "a.ts", 4);

        let spelled = dir.path().join(".").join("a.ts");
        let q = store.queue().enqueue_path(&spelled, false).unwrap();
        assert_eq!(q.catalog_id, a.id);

        let unknown = dir.path().join("never-scanned.ts");
        std::fs::write(&unknown, b"x").unwrap();
        let err = store.queue().enqueue_path(&unknown, true).unwrap_err();
        assert_eq!(err.reason(), "not_cataloged");
    }
}
