//! Local record store implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use crate::error::{Error, Result};
use crate::models::{Payload, Record, RecordId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

const RECORD_COLUMNS: &str =
    "id, kind, payload, local_revision, server_revision, modified_at, is_deleted, synced_payload";

/// Trait for on-device record storage
pub trait LocalStore {
    /// Get a live record by ID; tombstones report `NotFound`
    fn get(&self, id: &RecordId) -> Result<Record>;

    /// Get a record by ID including tombstones
    fn find(&self, id: &RecordId) -> Result<Option<Record>>;

    /// Insert or replace a record atomically
    fn put(&self, record: &Record) -> Result<()>;

    /// Tombstone a record, bumping its local revision
    fn delete(&self, id: &RecordId) -> Result<()>;

    /// Records (including tombstones) whose local revision is greater than `revision`
    fn list_modified_since(&self, revision: i64) -> Result<Vec<Record>>;

    /// Live records, most recently modified first
    fn list(&self, kind: Option<&str>, limit: usize, offset: usize) -> Result<Vec<Record>>;

    /// Next value of the store-wide revision sequence
    fn next_revision(&self) -> Result<i64>;
}

/// `SQLite` implementation of `LocalStore`
pub struct SqliteLocalStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteLocalStore<'a> {
    /// Create a new store with the given connection (or transaction)
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a record from a database row
    fn parse_record(row: &Row<'_>) -> rusqlite::Result<Record> {
        let id: String = row.get(0)?;
        Ok(Record {
            id: id
                .parse()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
            kind: row.get(1)?,
            payload: json_column(row, 2)?,
            local_revision: row.get(3)?,
            server_revision: row.get(4)?,
            modified_at: row.get(5)?,
            is_deleted: row.get::<_, i32>(6)? != 0,
            synced_payload: optional_json_column(row, 7)?,
        })
    }
}

impl LocalStore for SqliteLocalStore<'_> {
    fn get(&self, id: &RecordId) -> Result<Record> {
        match self.find(id)? {
            Some(record) if !record.is_deleted => Ok(record),
            _ => Err(Error::NotFound(id.to_string())),
        }
    }

    fn find(&self, id: &RecordId) -> Result<Option<Record>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?"),
                params![id.as_str()],
                Self::parse_record,
            )
            .optional()?;
        Ok(record)
    }

    fn put(&self, record: &Record) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        let synced = record
            .synced_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            "INSERT INTO records (id, kind, payload, local_revision, server_revision, modified_at, is_deleted, synced_payload)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                payload = excluded.payload,
                local_revision = excluded.local_revision,
                server_revision = excluded.server_revision,
                modified_at = excluded.modified_at,
                is_deleted = excluded.is_deleted,
                synced_payload = excluded.synced_payload",
            params![
                record.id.as_str(),
                record.kind,
                payload,
                record.local_revision,
                record.server_revision,
                record.modified_at,
                i32::from(record.is_deleted),
                synced,
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: &RecordId) -> Result<()> {
        let revision = self.next_revision()?;
        let now = chrono::Utc::now().timestamp_millis();

        let rows = self.conn.execute(
            "UPDATE records SET is_deleted = 1, local_revision = ?, modified_at = ?
             WHERE id = ? AND is_deleted = 0",
            params![revision, now, id.as_str()],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn list_modified_since(&self, revision: i64) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE local_revision > ?
             ORDER BY local_revision ASC"
        ))?;

        let records = stmt
            .query_map(params![revision], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn list(&self, kind: Option<&str>, limit: usize, offset: usize) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE is_deleted = 0 AND (?1 IS NULL OR kind = ?1)
             ORDER BY modified_at DESC, local_revision DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let records = stmt
            .query_map(
                params![kind, limit as i64, offset as i64],
                Self::parse_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn next_revision(&self) -> Result<i64> {
        let revision: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(local_revision), 0) + 1 FROM records",
            [],
            |row| row.get(0),
        )?;
        Ok(revision)
    }
}

/// Read a JSON object column
pub(crate) fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Payload> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a nullable JSON object column
pub(crate) fn optional_json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Payload>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        serde_json::from_str(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn stored(store: &SqliteLocalStore<'_>, kind: &str, value: serde_json::Value) -> Record {
        let mut record = Record::new(kind, payload(value));
        record.local_revision = store.next_revision().unwrap();
        store.put(&record).unwrap();
        record
    }

    #[test]
    fn test_put_and_get() {
        let db = setup();
        let store = SqliteLocalStore::new(db.connection());

        let record = stored(&store, "patient", json!({"name": "A", "age": 41}));
        let fetched = store.get(&record.id).unwrap();
        assert_eq!(fetched, record);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let db = setup();
        let store = SqliteLocalStore::new(db.connection());

        let error = store.get(&RecordId::new()).unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
    }

    #[test]
    fn test_put_replaces_existing_row() {
        let db = setup();
        let store = SqliteLocalStore::new(db.connection());

        let mut record = stored(&store, "patient", json!({"name": "A"}));
        record.payload = payload(json!({"name": "B"}));
        record.local_revision = store.next_revision().unwrap();
        record.server_revision = Some(7);
        store.put(&record).unwrap();

        let fetched = store.get(&record.id).unwrap();
        assert_eq!(fetched.payload["name"], "B");
        assert_eq!(fetched.server_revision, Some(7));
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let db = setup();
        let store = SqliteLocalStore::new(db.connection());

        let record = stored(&store, "patient", json!({"name": "A"}));
        store.delete(&record.id).unwrap();

        assert!(matches!(store.get(&record.id), Err(Error::NotFound(_))));
        let tombstone = store.find(&record.id).unwrap().unwrap();
        assert!(tombstone.is_deleted);
        assert!(tombstone.local_revision > record.local_revision);

        // Deleting twice is reported, not swallowed
        assert!(matches!(store.delete(&record.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_modified_since_orders_by_revision() {
        let db = setup();
        let store = SqliteLocalStore::new(db.connection());

        let first = stored(&store, "patient", json!({"name": "A"}));
        let second = stored(&store, "encounter", json!({"reason": "fever"}));
        let third = stored(&store, "patient", json!({"name": "C"}));

        let since_first = store.list_modified_since(first.local_revision).unwrap();
        let ids = since_first.iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![second.id, third.id]);

        store.delete(&second.id).unwrap();
        let since_third = store.list_modified_since(third.local_revision).unwrap();
        assert_eq!(since_third.len(), 1);
        assert!(since_third[0].is_deleted);
    }

    #[test]
    fn test_list_filters_kind_and_tombstones() {
        let db = setup();
        let store = SqliteLocalStore::new(db.connection());

        stored(&store, "patient", json!({"name": "A"}));
        let gone = stored(&store, "patient", json!({"name": "B"}));
        stored(&store, "encounter", json!({"reason": "cough"}));
        store.delete(&gone.id).unwrap();

        assert_eq!(store.list(Some("patient"), 10, 0).unwrap().len(), 1);
        assert_eq!(store.list(None, 10, 0).unwrap().len(), 2);
        assert_eq!(store.list(None, 1, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_next_revision_is_monotonic() {
        let db = setup();
        let store = SqliteLocalStore::new(db.connection());

        assert_eq!(store.next_revision().unwrap(), 1);
        let record = stored(&store, "patient", json!({}));
        assert_eq!(store.next_revision().unwrap(), record.local_revision + 1);
    }
}
