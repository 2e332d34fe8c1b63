//! SQLite-backed record store.
//!
//! One connection behind a mutex. Every trait method runs on that
//! connection; the two methods that must be atomic across processes
//! (`insert_active_if_absent`, `rotate`) run inside an IMMEDIATE
//! transaction, and a partial unique index makes a second active key
//! impossible at the schema level.
//!
//! Timestamps are stored as fixed-width RFC 3339 text (nanoseconds, `Z`),
//! so lexical order is chronological order.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use crate::error::Result;
use crate::keys::DataKeyRecord;
use crate::store::{KeyRecordStore, VaultItemStore};
use crate::vault::VaultItemRecord;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS data_keys (
    id          TEXT PRIMARY KEY,
    label       TEXT NOT NULL,
    wrapped_key TEXT NOT NULL,
    active      INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    rotated_at  TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS data_keys_single_active ON data_keys(active) WHERE active = 1;

CREATE TABLE IF NOT EXISTS vault_items (
    id          TEXT PRIMARY KEY,
    owner_id    TEXT NOT NULL,
    field       TEXT NOT NULL,
    key_id      TEXT NOT NULL,
    cipher_text TEXT NOT NULL,
    expires_at  TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS vault_items_owner ON vault_items(owner_id);
";

const KEY_COLUMNS: &str = "id, label, wrapped_key, active, created_at, rotated_at";
const ITEM_COLUMNS: &str = "id, owner_id, field, key_id, cipher_text, expires_at, created_at";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opened sqlite vault store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_ts(&raw, idx))
        .transpose()
}

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<DataKeyRecord> {
    Ok(DataKeyRecord {
        id: row.get(0)?,
        label: row.get(1)?,
        wrapped_key: row.get(2)?,
        active: row.get(3)?,
        created_at: parse_ts(&row.get::<_, String>(4)?, 4)?,
        rotated_at: opt_ts(row, 5)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<VaultItemRecord> {
    Ok(VaultItemRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        field: row.get(2)?,
        key_id: row.get(3)?,
        cipher_text: row.get(4)?,
        expires_at: opt_ts(row, 5)?,
        created_at: parse_ts(&row.get::<_, String>(6)?, 6)?,
    })
}

fn insert_key(conn: &Connection, record: &DataKeyRecord) -> rusqlite::Result<usize> {
    conn.execute(
        &format!("INSERT INTO data_keys ({KEY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
        params![
            record.id,
            record.label,
            record.wrapped_key,
            record.active,
            ts(&record.created_at),
            record.rotated_at.as_ref().map(ts),
        ],
    )
}

fn select_active(conn: &Connection) -> rusqlite::Result<Option<DataKeyRecord>> {
    conn.query_row(
        &format!(
            "SELECT {KEY_COLUMNS} FROM data_keys WHERE active = 1 ORDER BY created_at DESC LIMIT 1"
        ),
        [],
        key_from_row,
    )
    .optional()
}

impl KeyRecordStore for SqliteStore {
    fn insert_active_if_absent(&self, record: DataKeyRecord) -> Result<DataKeyRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = select_active(&tx)? {
            return Ok(existing);
        }
        let mut record = record;
        record.active = true;
        insert_key(&tx, &record)?;
        tx.commit()?;
        Ok(record)
    }

    fn find_active(&self) -> Result<Option<DataKeyRecord>> {
        Ok(select_active(&self.conn.lock())?)
    }

    fn find_key(&self, id: &str) -> Result<Option<DataKeyRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {KEY_COLUMNS} FROM data_keys WHERE id = ?1"),
                [id],
                key_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn rotate(&self, record: DataKeyRecord, rotated_at: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let retired = {
            let mut stmt = tx.prepare(
                "UPDATE data_keys SET active = 0, rotated_at = ?1 WHERE active = 1 RETURNING id",
            )?;
            let ids = stmt
                .query_map([ts(&rotated_at)], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        let mut record = record;
        record.active = true;
        insert_key(&tx, &record)?;
        tx.commit()?;
        debug!(retired = retired.len(), key_id = %record.id, "committed key rotation");
        Ok(retired)
    }

    fn list_keys(&self) -> Result<Vec<DataKeyRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {KEY_COLUMNS} FROM data_keys ORDER BY created_at ASC"
        ))?;
        let keys = stmt
            .query_map([], key_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }
}

impl VaultItemStore for SqliteStore {
    fn insert_item(&self, item: VaultItemRecord) -> Result<()> {
        self.conn.lock().execute(
            &format!("INSERT INTO vault_items ({ITEM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                item.id,
                item.owner_id,
                item.field,
                item.key_id,
                item.cipher_text,
                item.expires_at.as_ref().map(ts),
                ts(&item.created_at),
            ],
        )?;
        Ok(())
    }

    fn find_item(&self, id: &str) -> Result<Option<VaultItemRecord>> {
        let conn = self.conn.lock();
        let item = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM vault_items WHERE id = ?1"),
                [id],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    fn delete_item(&self, id: &str) -> Result<bool> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM vault_items WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }

    fn delete_owner_items(&self, owner_id: &str) -> Result<usize> {
        Ok(self
            .conn
            .lock()
            .execute("DELETE FROM vault_items WHERE owner_id = ?1", [owner_id])?)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.conn.lock().execute(
            "DELETE FROM vault_items WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            [ts(&now)],
        )?)
    }

    fn list_owner_items(&self, owner_id: &str) -> Result<Vec<VaultItemRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM vault_items WHERE owner_id = ?1 ORDER BY created_at ASC"
        ))?;
        let items = stmt
            .query_map([owner_id], item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_survive_storage() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = DataKeyRecord {
            id: "k1".into(),
            label: "first".into(),
            wrapped_key: "enc::x".into(),
            active: true,
            created_at: Utc::now(),
            rotated_at: None,
        };
        store.insert_active_if_absent(record.clone()).unwrap();
        assert_eq!(store.find_key("k1").unwrap(), Some(record));
    }

    #[test]
    fn test_schema_forbids_two_active_keys() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.conn.lock();
        let key = |id: &str| DataKeyRecord {
            id: id.into(),
            label: id.into(),
            wrapped_key: "enc::x".into(),
            active: true,
            created_at: Utc::now(),
            rotated_at: None,
        };
        insert_key(&conn, &key("a")).unwrap();
        assert!(insert_key(&conn, &key("b")).is_err());
    }

    #[test]
    fn test_rotate_reports_deactivated_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        let key = |id: &str| DataKeyRecord {
            id: id.into(),
            label: id.into(),
            wrapped_key: "enc::x".into(),
            active: true,
            created_at: Utc::now(),
            rotated_at: None,
        };

        assert!(store.rotate(key("a"), Utc::now()).unwrap().is_empty());
        assert_eq!(store.rotate(key("b"), Utc::now()).unwrap(), ["a"]);
        assert_eq!(store.find_active().unwrap().unwrap().id, "b");
        assert!(store.find_key("a").unwrap().unwrap().rotated_at.is_some());
    }
}
