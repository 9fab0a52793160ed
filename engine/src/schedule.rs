// --- Schedule ---------------------------------------------------------------
//
// Cyclic playlist used to refill the queue forever. Positions are dense
// [0, n-1]; at most one row carries `is_current`, and `next()` moves that
// cursor one step around the ring.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::{self, CatalogEntry};
use crate::db::{unix_now, Store};
use crate::error::{PlayoutError, Result};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduleItem {
    pub id: i64,
    pub catalog_id: String,
    pub position: i64,
    pub is_current: bool,
    pub added_at: i64,
}

const COLUMNS: &str = "id, file_id, position, is_current, added_at";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleItem> {
    Ok(ScheduleItem {
        id: row.get(0)?,
        catalog_id: row.get(1)?,
        position: row.get(2)?,
        is_current: row.get::<_, i64>(3)? != 0,
        added_at: row.get(4)?,
    })
}

fn by_id(tx: &Transaction<'_>, id: i64) -> Result<Option<ScheduleItem>> {
    let sql = format!("SELECT {COLUMNS} FROM schedule WHERE id = ?1");
    Ok(tx.query_row(&sql, params![id], item_from_row).optional()?)
}

fn by_catalog_id(tx: &Transaction<'_>, catalog_id: &str) -> Result<Option<ScheduleItem>> {
    let sql = format!("SELECT {COLUMNS} FROM schedule WHERE file_id = ?1");
    Ok(tx.query_row(&sql, params![catalog_id], item_from_row).optional()?)
}

fn append(tx: &Transaction<'_>, catalog_id: &str) -> Result<ScheduleItem> {
    let position: i64 = tx.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM schedule",
        [],
        |r| r.get(0),
    )?;
    tx.execute(
        "INSERT INTO schedule (file_id, position, is_current, added_at) VALUES (?1, ?2, 0, ?3)",
        params![catalog_id, position, unix_now()],
    )?;
    let id = tx.last_insert_rowid();
    by_id(tx, id)?.ok_or_else(|| PlayoutError::Internal(format!("schedule row {id} vanished")))
}

fn delete_and_repack(tx: &Transaction<'_>, item: &ScheduleItem) -> Result<()> {
    tx.execute("DELETE FROM schedule WHERE id = ?1", params![item.id])?;
    tx.execute(
        "UPDATE schedule SET position = position - 1 WHERE position > ?1",
        params![item.position],
    )?;
    Ok(())
}

pub struct Schedule<'a> {
    store: &'a Store,
}

impl Store {
    pub fn schedule(&self) -> Schedule<'_> {
        Schedule { store: self }
    }
}

impl Schedule<'_> {
    /// Append a catalog entry to the ring. Adding an entry that is already
    /// scheduled returns the existing row unchanged.
    pub fn add(&self, catalog_id: &str) -> Result<ScheduleItem> {
        let (item, created) = self.store.with_tx(|tx| {
            catalog::require(tx, catalog_id)?;
            if let Some(existing) = by_catalog_id(tx, catalog_id)? {
                return Ok((existing, false));
            }
            Ok((append(tx, catalog_id)?, true))
        })?;
        if created {
            info!(file_id = %item.catalog_id, position = item.position, "file added to schedule");
        }
        Ok(item)
    }

    /// Append every entry not yet scheduled, in the order given.
    pub fn populate(&self, entries: &[CatalogEntry]) -> Result<usize> {
        let added = self.store.with_tx(|tx| {
            let mut added = 0;
            for e in entries {
                if by_catalog_id(tx, &e.id)?.is_none() {
                    append(tx, &e.id)?;
                    added += 1;
                }
            }
            Ok(added)
        })?;
        info!(added, "schedule populated from catalog");
        Ok(added)
    }

    /// Advance the cursor and return the new current item.
    ///
    /// With no current item this starts at the lowest position; after the
    /// last position it wraps back to the lowest. `None` only when the
    /// schedule is empty.
    pub fn next(&self) -> Result<Option<ScheduleItem>> {
        let next = self.store.with_tx(|tx| {
            let current: Option<i64> = tx
                .query_row(
                    "SELECT position FROM schedule WHERE is_current = 1 ORDER BY position LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?;

            let first_sql = format!("SELECT {COLUMNS} FROM schedule ORDER BY position ASC, id ASC LIMIT 1");
            let chosen = match current {
                None => tx.query_row(&first_sql, [], item_from_row).optional()?,
                Some(pos) => {
                    let sql = format!(
                        "SELECT {COLUMNS} FROM schedule WHERE position > ?1 ORDER BY position ASC, id ASC LIMIT 1"
                    );
                    match tx.query_row(&sql, params![pos], item_from_row).optional()? {
                        Some(item) => Some(item),
                        None => tx.query_row(&first_sql, [], item_from_row).optional()?,
                    }
                }
            };

            let Some(mut item) = chosen else {
                return Ok(None);
            };
            tx.execute("UPDATE schedule SET is_current = 0 WHERE is_current = 1", [])?;
            tx.execute("UPDATE schedule SET is_current = 1 WHERE id = ?1", params![item.id])?;
            item.is_current = true;
            Ok(Some(item))
        })?;

        if let Some(item) = &next {
            debug!(file_id = %item.catalog_id, position = item.position, "schedule advanced");
        }
        Ok(next)
    }

    pub fn reset(&self) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute("UPDATE schedule SET is_current = 0", [])?;
            Ok(())
        })?;
        info!("schedule cursor reset");
        Ok(())
    }

    /// Remove the row for `catalog_id`.
    pub fn remove(&self, catalog_id: &str) -> Result<ScheduleItem> {
        let item = self.store.with_tx(|tx| {
            let item = by_catalog_id(tx, catalog_id)?
                .ok_or_else(|| PlayoutError::NotFound(format!("schedule entry for {catalog_id}")))?;
            delete_and_repack(tx, &item)?;
            Ok(item)
        })?;
        info!(file_id = %catalog_id, "file removed from schedule");
        Ok(item)
    }

    pub fn remove_by_id(&self, id: i64) -> Result<ScheduleItem> {
        let item = self.store.with_tx(|tx| {
            let item =
                by_id(tx, id)?.ok_or_else(|| PlayoutError::NotFound(format!("schedule item {id}")))?;
            delete_and_repack(tx, &item)?;
            Ok(item)
        })?;
        info!(schedule_id = id, file_id = %item.catalog_id, "schedule item removed");
        Ok(item)
    }

    /// Move one item to `new_position` (clamped to the ring), shifting the
    /// items in between by one.
    pub fn reorder(&self, id: i64, new_position: i64) -> Result<ScheduleItem> {
        self.store.with_tx(|tx| {
            let item =
                by_id(tx, id)?.ok_or_else(|| PlayoutError::NotFound(format!("schedule item {id}")))?;
            let count: i64 = tx.query_row("SELECT COUNT(*) FROM schedule", [], |r| r.get(0))?;
            let target = new_position.clamp(0, (count - 1).max(0));
            let old = item.position;

            if target < old {
                tx.execute(
                    "UPDATE schedule SET position = position + 1 WHERE position >= ?1 AND position < ?2",
                    params![target, old],
                )?;
            } else if target > old {
                tx.execute(
                    "UPDATE schedule SET position = position - 1 WHERE position > ?1 AND position <= ?2",
                    params![old, target],
                )?;
            }
            tx.execute("UPDATE schedule SET position = ?2 WHERE id = ?1", params![id, target])?;
            debug!(schedule_id = id, from = old, to = target, "schedule item moved");
            by_id(tx, id)?.ok_or_else(|| PlayoutError::Internal(format!("schedule row {id} vanished")))
        })
    }

    /// Apply many position updates at once.
    ///
    /// Every id is checked before anything changes. Afterwards the ring is
    /// renumbered by (position, id), so duplicate or sparse targets still end
    /// up dense.
    pub fn bulk_reorder(&self, positions: &HashMap<i64, i64>) -> Result<()> {
        self.store.with_tx(|tx| {
            for id in positions.keys() {
                if by_id(tx, *id)?.is_none() {
                    return Err(PlayoutError::NotFound(format!("schedule item {id}")));
                }
            }
            for (id, position) in positions {
                tx.execute(
                    "UPDATE schedule SET position = ?2 WHERE id = ?1",
                    params![id, position],
                )?;
            }

            let ids: Vec<i64> = {
                let mut stmt = tx.prepare("SELECT id FROM schedule ORDER BY position ASC, id ASC")?;
                let rows = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            for (idx, id) in ids.iter().enumerate() {
                tx.execute(
                    "UPDATE schedule SET position = ?2 WHERE id = ?1",
                    params![id, idx as i64],
                )?;
            }
            Ok(())
        })?;
        info!(updates = positions.len(), "schedule reordered");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ScheduleItem>> {
        self.store.with_conn(|conn| {
            let sql = format!("SELECT {COLUMNS} FROM schedule ORDER BY position ASC, id ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], item_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn clear(&self) -> Result<usize> {
        let n = self
            .store
            .with_conn(|conn| Ok(conn.execute("DELETE FROM schedule", [])?))?;
        info!(deleted_count = n, "schedule cleared");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::cataloged_file;

    fn three(store: &Store, dir: &std::path::Path) -> Vec<CatalogEntry> {
        ["a.ts", "b.ts", "c.ts"]
            .iter()
            .map(|n| cataloged_file(store, dir, n, 4))
            .collect()
    }

    fn positions(store: &Store) -> Vec<i64> {
        store.schedule().list().unwrap().iter().map(|s| s.position).collect()
    }

    #[test]
    fn add_appends_densely_and_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let files = three(&store, dir.path());

        let first = store.schedule().add(&files[0].id).unwrap();
        assert_eq!(first.position, 0);
        store.schedule().add(&files[1].id).unwrap();
        let again = store.schedule().add(&files[0].id).unwrap();
        assert_eq!(again, first);
        assert_eq!(positions(&store), vec![0, 1]);

        let err = store.schedule().add("unknown").unwrap_err();
        assert_eq!(err.reason(), "not_cataloged");
    }

    #[test]
    fn next_cycles_through_the_ring() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let files = three(&store, dir.path());
        store.schedule().populate(&files).unwrap();

        let seen: Vec<i64> = (0..4)
            .map(|_| store.schedule().next().unwrap().unwrap().position)
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 0]);

        let current: Vec<_> = store
            .schedule()
            .list()
            .unwrap()
            .into_iter()
            .filter(|s| s.is_current)
            .collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].position, 0);
    }

    #[test]
    fn next_on_empty_schedule_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.schedule().next().unwrap().is_none());
    }

    #[test]
    fn reset_restarts_from_the_lowest_position() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let files = three(&store, dir.path());
        store.schedule().populate(&files).unwrap();
        store.schedule().next().unwrap();
        store.schedule().next().unwrap();

        store.schedule().reset().unwrap();
        assert!(store.schedule().list().unwrap().iter().all(|s| !s.is_current));
        assert_eq!(store.schedule().next().unwrap().unwrap().position, 0);
    }

    #[test]
    fn populate_skips_already_scheduled_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let files = three(&store, dir.path());
        store.schedule().add(&files[1].id).unwrap();

        assert_eq!(store.schedule().populate(&files).unwrap(), 2);
        let order: Vec<String> = store
            .schedule()
            .list()
            .unwrap()
            .into_iter()
            .map(|s| s.catalog_id)
            .collect();
        assert_eq!(order, vec![files[1].id.clone(), files[0].id.clone(), files[2].id.clone()]);
    }

    #[test]
    fn remove_keeps_positions_dense() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let files = three(&store, dir.path());
        store.schedule().populate(&files).unwrap();

        let middle = store.schedule().list().unwrap()[1].clone();
        store.schedule().remove_by_id(middle.id).unwrap();
        assert_eq!(positions(&store), vec![0, 1]);

        store.schedule().remove(&files[0].id).unwrap();
        assert_eq!(positions(&store), vec![0]);

        assert_eq!(store.schedule().remove_by_id(middle.id).unwrap_err().reason(), "not_found");
        assert_eq!(store.schedule().remove(&files[0].id).unwrap_err().reason(), "not_found");
    }

    #[test]
    fn reorder_clamps_and_shifts() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let files = three(&store, dir.path());
        store.schedule().populate(&files).unwrap();
        let items = store.schedule().list().unwrap();

        // last -> front
        store.schedule().reorder(items[2].id, 0).unwrap();
        let order: Vec<i64> = store.schedule().list().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(order, vec![items[2].id, items[0].id, items[1].id]);
        assert_eq!(positions(&store), vec![0, 1, 2]);

        // far past the end clamps to the last slot
        let moved = store.schedule().reorder(items[2].id, 99).unwrap();
        assert_eq!(moved.position, 2);
        let order: Vec<i64> = store.schedule().list().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(order, vec![items[0].id, items[1].id, items[2].id]);

        let moved = store.schedule().reorder(items[1].id, -5).unwrap();
        assert_eq!(moved.position, 0);
        assert_eq!(positions(&store), vec![0, 1, 2]);

        assert_eq!(store.schedule().reorder(4242, 0).unwrap_err().reason(), "not_found");
    }

    #[test]
    fn bulk_reorder_is_all_or_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let files = three(&store, dir.path());
        store.schedule().populate(&files).unwrap();
        let items = store.schedule().list().unwrap();

        let mut bad = HashMap::new();
        bad.insert(items[0].id, 2);
        bad.insert(9999, 0);
        assert_eq!(store.schedule().bulk_reorder(&bad).unwrap_err().reason(), "not_found");
        assert_eq!(store.schedule().list().unwrap(), items);

        let mut good = HashMap::new();
        good.insert(items[0].id, 10);
        good.insert(items[2].id, 10);
        store.schedule().bulk_reorder(&good).unwrap();
        let order: Vec<i64> = store.schedule().list().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(order, vec![items[1].id, items[0].id, items[2].id]);
        assert_eq!(positions(&store), vec![0, 1, 2]);
    }

    #[test]
    fn clear_empties_the_ring() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let files = three(&store, dir.path());
        store.schedule().populate(&files).unwrap();
        assert_eq!(store.schedule().clear().unwrap(), 3);
        assert!(store.schedule().list().unwrap().is_empty());
        assert_eq!(store.schedule().clear().unwrap(), 0);
    }
}
