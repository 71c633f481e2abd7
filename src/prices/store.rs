//! SQLite persistence for items, price entries and categories.
//!
//! - WAL mode for concurrent reads during writes
//! - Prepared statement caching
//! - Batch inserts inside a single transaction
//! - The unique gid constraint is the arbiter for concurrent first
//!   observations of an item
//! - Near-duplicate suppression: a unique index over
//!   (item_id, quantity, price, minute_bucket) plus a window pre-check,
//!   both counted as dedup rather than failure

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use crate::models::{Item, ItemWithPrices, PriceEntry, PriceObservation, SubCategory};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sub_categories (
    id INTEGER PRIMARY KEY,
    dofus_id INTEGER NOT NULL UNIQUE CHECK (dofus_id > 0),
    name TEXT NOT NULL CHECK (length(trim(name)) > 0),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY,
    item_gid INTEGER NOT NULL UNIQUE CHECK (item_gid > 0),
    item_name TEXT CHECK (item_name IS NULL OR length(trim(item_name)) > 0),
    sub_category_id INTEGER REFERENCES sub_categories(id) ON DELETE SET NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS price_entries (
    id INTEGER PRIMARY KEY,
    item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    price INTEGER NOT NULL CHECK (price > 0),
    quantity INTEGER NOT NULL CHECK (quantity IN (1, 10, 100)),
    server_timestamp INTEGER CHECK (server_timestamp IS NULL OR server_timestamp > 0),
    created_at INTEGER NOT NULL,
    minute_bucket INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_price_entries_created
    ON price_entries(created_at);
CREATE INDEX IF NOT EXISTS idx_price_entries_item_qty
    ON price_entries(item_id, quantity);
CREATE INDEX IF NOT EXISTS idx_price_entries_item_created
    ON price_entries(item_id, created_at DESC);
CREATE UNIQUE INDEX IF NOT EXISTS uq_price_entries_dedup
    ON price_entries(item_id, quantity, price, minute_bucket);
"#;

/// Result of a persistence pass over extracted observations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub persisted: u64,
    /// Suppressed as near-duplicates of recent entries
    pub deduped: u64,
}

#[derive(Clone)]
pub struct PriceStore {
    conn: Arc<Mutex<Connection>>,
    dedup_window_secs: i64,
}

impl PriceStore {
    pub fn open(db_path: &str, dedup_window_secs: i64) -> rusqlite::Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn, dedup_window_secs, db_path)
    }

    /// In-memory store, used by tests
    pub fn open_in_memory(dedup_window_secs: i64) -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, dedup_window_secs, ":memory:")
    }

    fn init(conn: Connection, dedup_window_secs: i64, path: &str) -> rusqlite::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!(path, "price_store_opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dedup_window_secs,
        })
    }

    /// Persist a set of validated observations in one transaction.
    ///
    /// Items are upserted by gid; the unique constraint resolves concurrent
    /// first observations. Duplicate entries within the dedup window are
    /// suppressed and counted, never raised.
    pub fn persist_observations(
        &self,
        observations: &[PriceObservation],
    ) -> rusqlite::Result<PersistOutcome> {
        if observations.is_empty() {
            return Ok(PersistOutcome::default());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut outcome = PersistOutcome::default();

        for obs in observations {
            let item_id = Self::get_or_create_item_tx(&tx, obs.item_gid, Some(obs.category))?;
            let created_at = obs.observed_at.timestamp();

            if self.dedup_window_secs > 0 {
                let recent_dup: bool = tx.query_row(
                    "SELECT EXISTS(
                         SELECT 1 FROM price_entries
                          WHERE item_id = ?1 AND quantity = ?2 AND price = ?3
                            AND created_at >= ?4)",
                    params![item_id, obs.quantity, obs.price, created_at - self.dedup_window_secs],
                    |row| row.get(0),
                )?;
                if recent_dup {
                    outcome.deduped += 1;
                    continue;
                }
            }

            let changed = tx.execute(
                "INSERT OR IGNORE INTO price_entries
                     (item_id, price, quantity, server_timestamp, created_at, minute_bucket)
                 VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
                params![item_id, obs.price, obs.quantity, created_at, created_at / 60],
            )?;
            if changed == 0 {
                outcome.deduped += 1;
            } else {
                outcome.persisted += 1;
            }
        }

        tx.commit()?;
        debug!(
            persisted = outcome.persisted,
            deduped = outcome.deduped,
            "observations_persisted"
        );
        Ok(outcome)
    }

    /// Lookup-or-insert by gid. Idempotent: the insert is OR IGNORE and the
    /// row is re-read afterwards, so concurrent callers converge on one row.
    pub fn get_or_create_item(&self, gid: i64) -> rusqlite::Result<Item> {
        let conn = self.conn.lock();
        let id = Self::get_or_create_item_tx_conn(&conn, gid, None)?;
        Self::item_by_id(&conn, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    fn get_or_create_item_tx(tx: &Transaction<'_>, gid: i64, category: Option<u32>) -> rusqlite::Result<i64> {
        Self::get_or_create_item_tx_conn(tx, gid, category)
    }

    fn get_or_create_item_tx_conn(
        conn: &Connection,
        gid: i64,
        category: Option<u32>,
    ) -> rusqlite::Result<i64> {
        let now = Utc::now().timestamp();
        conn.prepare_cached(
            "INSERT OR IGNORE INTO items
                 (item_gid, item_name, sub_category_id, created_at, updated_at)
             VALUES (?1, ?2,
                     (SELECT id FROM sub_categories WHERE dofus_id = ?3),
                     ?4, ?4)",
        )?
        .execute(params![gid, Item::placeholder_name(gid), category, now])?;

        conn.prepare_cached("SELECT id FROM items WHERE item_gid = ?1")?
            .query_row(params![gid], |row| row.get(0))
    }

    pub fn item_by_gid(&self, gid: i64) -> rusqlite::Result<Option<Item>> {
        let conn = self.conn.lock();
        let result = conn
            .prepare_cached(
                "SELECT id, item_gid, item_name, sub_category_id, created_at, updated_at
                   FROM items WHERE item_gid = ?1",
            )?
            .query_row(params![gid], map_item)
            .optional();
        result
    }

    fn item_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<Item>> {
        conn.prepare_cached(
            "SELECT id, item_gid, item_name, sub_category_id, created_at, updated_at
               FROM items WHERE id = ?1",
        )?
        .query_row(params![id], map_item)
        .optional()
    }

    /// Newest entry for (gid, quantity)
    pub fn latest_price(&self, gid: i64, quantity: u32) -> rusqlite::Result<Option<PriceEntry>> {
        let conn = self.conn.lock();
        let result = conn
            .prepare_cached(
                "SELECT e.id, e.item_id, e.price, e.quantity, e.server_timestamp, e.created_at
                   FROM price_entries e
                   JOIN items i ON i.id = e.item_id
                  WHERE i.item_gid = ?1 AND e.quantity = ?2
                  ORDER BY e.created_at DESC, e.id DESC
                  LIMIT 1",
            )?
            .query_row(params![gid, quantity], map_entry)
            .optional();
        result
    }

    /// Entries for (gid, quantity) within [from, to], oldest first
    pub fn price_history(
        &self,
        gid: i64,
        quantity: u32,
        from: i64,
        to: i64,
    ) -> rusqlite::Result<Vec<PriceEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT e.id, e.item_id, e.price, e.quantity, e.server_timestamp, e.created_at
               FROM price_entries e
               JOIN items i ON i.id = e.item_id
              WHERE i.item_gid = ?1 AND e.quantity = ?2
                AND e.created_at >= ?3 AND e.created_at <= ?4
              ORDER BY e.created_at ASC, e.id ASC",
        )?;
        let rows = stmt.query_map(params![gid, quantity, from, to], map_entry)?;
        rows.collect()
    }

    /// Item plus its most recent entries across all quantities
    pub fn item_with_prices(&self, gid: i64, limit: usize) -> rusqlite::Result<Option<ItemWithPrices>> {
        let item = match self.item_by_gid(gid)? {
            Some(item) => item,
            None => return Ok(None),
        };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, item_id, price, quantity, server_timestamp, created_at
               FROM price_entries
              WHERE item_id = ?1
              ORDER BY created_at DESC, id DESC
              LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![item.id, limit as i64], map_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(ItemWithPrices { item, entries }))
    }

    /// Upsert an auction-house category by its game id
    pub fn upsert_sub_category(&self, dofus_id: i64, name: &str) -> rusqlite::Result<SubCategory> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp();
        conn.prepare_cached(
            "INSERT INTO sub_categories (dofus_id, name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(dofus_id) DO UPDATE SET
                 name = excluded.name,
                 updated_at = excluded.updated_at",
        )?
        .execute(params![dofus_id, name, now])?;

        let result = conn
            .prepare_cached(
                "SELECT id, dofus_id, name, created_at, updated_at
                   FROM sub_categories WHERE dofus_id = ?1",
            )?
            .query_row(params![dofus_id], |row| {
                Ok(SubCategory {
                    id: row.get(0)?,
                    dofus_id: row.get(1)?,
                    name: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            });
        result
    }

    pub fn entry_count(&self) -> rusqlite::Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM price_entries", [], |row| row.get(0))
    }

    pub fn item_count(&self) -> rusqlite::Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
    }
}

fn map_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        item_gid: row.get(1)?,
        item_name: row.get(2)?,
        sub_category_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<PriceEntry> {
    Ok(PriceEntry {
        id: row.get(0)?,
        item_id: row.get(1)?,
        price: row.get(2)?,
        quantity: row.get(3)?,
        server_timestamp: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn store() -> PriceStore {
        PriceStore::open_in_memory(600).unwrap()
    }

    fn obs(gid: i64, quantity: u32, price: i64) -> PriceObservation {
        PriceObservation::new(gid, 48, quantity, price)
    }

    #[test]
    fn test_item_created_with_placeholder() {
        let s = store();
        let item = s.get_or_create_item(289).unwrap();
        assert_eq!(item.item_gid, 289);
        assert_eq!(item.item_name.as_deref(), Some("Item #289"));
        // Second call returns the same row
        let again = s.get_or_create_item(289).unwrap();
        assert_eq!(again.id, item.id);
        assert_eq!(s.item_count().unwrap(), 1);
    }

    #[test]
    fn test_persist_and_read_back() {
        let s = store();
        let outcome = s
            .persist_observations(&[obs(289, 1, 15_000), obs(289, 10, 140_000), obs(289, 100, 1_300_000)])
            .unwrap();
        assert_eq!(outcome, PersistOutcome { persisted: 3, deduped: 0 });

        let latest = s.latest_price(289, 10).unwrap().unwrap();
        assert_eq!(latest.price, 140_000);
        assert_eq!(latest.quantity, 10);

        let with_prices = s.item_with_prices(289, 10).unwrap().unwrap();
        assert_eq!(with_prices.entries.len(), 3);
        assert_eq!(with_prices.item.item_gid, 289);
    }

    #[test]
    fn test_duplicate_within_window_suppressed() {
        let s = store();
        let o = obs(289, 1, 15_000);
        assert_eq!(s.persist_observations(&[o]).unwrap().persisted, 1);
        let second = s.persist_observations(&[o]).unwrap();
        assert_eq!(second, PersistOutcome { persisted: 0, deduped: 1 });
        assert_eq!(s.entry_count().unwrap(), 1);
    }

    #[test]
    fn test_old_duplicate_outside_window_persists() {
        let s = store();
        let mut old = obs(289, 1, 15_000);
        old.observed_at = Utc::now() - ChronoDuration::seconds(3_600);
        assert_eq!(s.persist_observations(&[old]).unwrap().persisted, 1);

        // Same tuple, an hour later: outside the window and a different
        // minute bucket, so it persists
        assert_eq!(s.persist_observations(&[obs(289, 1, 15_000)]).unwrap().persisted, 1);
        assert_eq!(s.entry_count().unwrap(), 2);
    }

    #[test]
    fn test_different_price_same_minute_persists() {
        let s = store();
        assert_eq!(s.persist_observations(&[obs(289, 1, 15_000)]).unwrap().persisted, 1);
        assert_eq!(s.persist_observations(&[obs(289, 1, 15_001)]).unwrap().persisted, 1);
        assert_eq!(s.entry_count().unwrap(), 2);
    }

    #[test]
    fn test_price_history_range() {
        let s = store();
        let now = Utc::now();
        let mut a = obs(289, 1, 10);
        a.observed_at = now - ChronoDuration::seconds(7_200);
        let mut b = obs(289, 1, 20);
        b.observed_at = now - ChronoDuration::seconds(1_800);
        s.persist_observations(&[a, b]).unwrap();

        let from = (now - ChronoDuration::seconds(3_600)).timestamp();
        let history = s.price_history(289, 1, from, now.timestamp()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].price, 20);
    }

    #[test]
    fn test_sub_category_upsert_and_link() {
        let s = store();
        let cat = s.upsert_sub_category(48, "Resources").unwrap();
        assert_eq!(cat.dofus_id, 48);
        assert_eq!(cat.name, "Resources");

        // Upsert refreshes the name, keeps the row
        let renamed = s.upsert_sub_category(48, "Ressources").unwrap();
        assert_eq!(renamed.id, cat.id);
        assert_eq!(renamed.name, "Ressources");

        // Items observed under a known category link to it on creation
        s.persist_observations(&[obs(289, 1, 15_000)]).unwrap();
        let item = s.item_by_gid(289).unwrap().unwrap();
        assert_eq!(item.sub_category_id, Some(cat.id));
    }

    #[test]
    fn test_item_without_known_category_unlinked() {
        let s = store();
        s.persist_observations(&[obs(289, 1, 15_000)]).unwrap();
        assert_eq!(s.item_by_gid(289).unwrap().unwrap().sub_category_id, None);
    }

    #[test]
    fn test_concurrent_get_or_create_single_row() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let s = PriceStore::open(tmp.path().to_str().unwrap(), 600).unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = s.clone();
            handles.push(std::thread::spawn(move || s.get_or_create_item(777).unwrap().id));
        }
        let ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(s.item_count().unwrap(), 1);
    }
}
