//! Change tracker
//!
//! Every local mutation goes through [`ChangeTracker`], which writes the record
//! and appends exactly one [`ChangeRecord`] (plus its pending queue entry) in a
//! single transaction. The orchestrator's write-backs use the same path.

use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

use crate::db::{json_column, with_transaction, LocalStore, SqliteLocalStore};
use crate::error::{Error, Result};
use crate::models::{ChangeId, ChangeOp, ChangeRecord, Payload, Record, RecordId};
use crate::queue::SyncQueue;
use crate::util::{is_valid_kind, now_ms};

pub(crate) const CHANGE_COLUMNS: &str =
    "c.id, c.record_id, c.kind, c.op, c.payload, c.local_revision, c.base_revision, c.created_at";

/// A server-side version of a record to be written locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVersion {
    pub kind: String,
    pub payload: Payload,
    pub revision: i64,
    pub modified_at: i64,
    pub deleted: bool,
}

/// Wraps the mutation paths of the local store
pub struct ChangeTracker<'a> {
    conn: &'a Connection,
}

impl<'a> ChangeTracker<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create a record and log its creation
    pub fn create(&self, kind: &str, payload: Payload) -> Result<Record> {
        if !is_valid_kind(kind) {
            return Err(Error::InvalidInput(format!("invalid record kind '{kind}'")));
        }

        let record = with_transaction(self.conn, |tx| {
            let store = SqliteLocalStore::new(tx);
            let mut record = Record::new(kind, payload);
            record.local_revision = store.next_revision()?;
            store.put(&record)?;
            append_change(tx, &record, ChangeOp::Create, record.server_revision)?;
            Ok(record)
        })?;

        tracing::debug!("Created {} {}", record.kind, record.id);
        Ok(record)
    }

    /// Replace a live record's payload and log the update
    pub fn update(&self, id: &RecordId, payload: Payload) -> Result<Record> {
        with_transaction(self.conn, |tx| {
            let store = SqliteLocalStore::new(tx);
            let mut record = store.get(id)?;
            record.payload = payload;
            record.local_revision = store.next_revision()?;
            record.modified_at = now_ms().max(record.modified_at);
            store.put(&record)?;
            append_change(tx, &record, ChangeOp::Update, record.server_revision)?;
            Ok(record)
        })
    }

    /// Tombstone a live record and log the deletion
    pub fn delete(&self, id: &RecordId) -> Result<Record> {
        with_transaction(self.conn, |tx| {
            let store = SqliteLocalStore::new(tx);
            store.delete(id)?;
            let record = store
                .find(id)?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            append_change(tx, &record, ChangeOp::Delete, record.server_revision)?;
            Ok(record)
        })
    }

    /// Write the outcome of a conflict resolution that still has to reach the
    /// server: the record is rebased onto `remote` and a new change is logged
    /// against the remote revision.
    pub fn apply_resolution(
        &self,
        id: &RecordId,
        resolved: Payload,
        deleted: bool,
        remote: &RemoteVersion,
    ) -> Result<Record> {
        with_transaction(self.conn, |tx| {
            let store = SqliteLocalStore::new(tx);
            let mut record = store
                .find(id)?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            record.payload = resolved;
            record.is_deleted = deleted;
            record.local_revision = store.next_revision()?;
            record.modified_at = now_ms().max(remote.modified_at);
            record.server_revision = Some(remote.revision);
            record.synced_payload = Some(remote.payload.clone());
            store.put(&record)?;

            let op = if deleted {
                ChangeOp::Delete
            } else {
                ChangeOp::Update
            };
            append_change(tx, &record, op, Some(remote.revision))?;
            Ok(record)
        })
    }

    /// Adopt a server version locally without logging a change
    pub fn apply_remote(&self, id: &RecordId, remote: &RemoteVersion) -> Result<Record> {
        with_transaction(self.conn, |tx| {
            let store = SqliteLocalStore::new(tx);
            let record = Record {
                id: *id,
                kind: remote.kind.clone(),
                payload: remote.payload.clone(),
                local_revision: store.next_revision()?,
                server_revision: Some(remote.revision),
                modified_at: remote.modified_at,
                is_deleted: remote.deleted,
                synced_payload: Some(remote.payload.clone()),
            };
            store.put(&record)?;
            Ok(record)
        })
    }

    /// Record a server acknowledgment; the server revision never moves backwards
    pub fn commit_acknowledged(
        &self,
        id: &RecordId,
        server_revision: i64,
        acknowledged_payload: &Payload,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE records SET server_revision = ?, synced_payload = ?
             WHERE id = ? AND (server_revision IS NULL OR server_revision < ?)",
            params![
                server_revision,
                serde_json::to_string(acknowledged_payload)?,
                id.as_str(),
                server_revision
            ],
        )?;
        Ok(rows > 0)
    }

    /// Logged changes for a record that have not been pruned, oldest first
    pub fn history(&self, id: &RecordId) -> Result<Vec<ChangeRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHANGE_COLUMNS} FROM change_log c
             WHERE c.record_id = ?
             ORDER BY c.local_revision ASC"
        ))?;

        let changes = stmt
            .query_map(params![id.as_str()], parse_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }
}

/// Rebuild the state a sequence of changes leads to: the final payload and
/// whether the record ends up deleted. Changes are applied in revision order.
pub fn replay(changes: &[ChangeRecord]) -> Option<(Payload, bool)> {
    let mut ordered = changes.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|change| change.local_revision);

    ordered.into_iter().fold(None, |_, change| {
        Some((change.payload.clone(), change.op == ChangeOp::Delete))
    })
}

fn append_change(
    conn: &Connection,
    record: &Record,
    op: ChangeOp,
    base_revision: Option<i64>,
) -> Result<ChangeRecord> {
    let change = ChangeRecord {
        id: ChangeId::new(),
        record_id: record.id,
        kind: record.kind.clone(),
        op,
        payload: record.payload.clone(),
        local_revision: record.local_revision,
        base_revision,
        created_at: record.modified_at,
    };

    conn.execute(
        "INSERT INTO change_log (id, record_id, kind, op, payload, local_revision, base_revision, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            change.id.as_str(),
            change.record_id.as_str(),
            change.kind,
            change.op.as_str(),
            serde_json::to_string(&change.payload)?,
            change.local_revision,
            change.base_revision,
            change.created_at,
        ],
    )?;
    SyncQueue::new(conn).enqueue(&change)?;

    Ok(change)
}

/// Parse a change record from a row selected with `CHANGE_COLUMNS` first
pub(crate) fn parse_change(row: &Row<'_>) -> rusqlite::Result<ChangeRecord> {
    let conversion =
        |idx: usize, e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into());

    let id: String = row.get(0)?;
    let record_id: String = row.get(1)?;
    let op: String = row.get(3)?;
    Ok(ChangeRecord {
        id: id.parse().map_err(|e: uuid::Error| conversion(0, e.to_string()))?,
        record_id: record_id
            .parse()
            .map_err(|e: uuid::Error| conversion(1, e.to_string()))?,
        kind: row.get(2)?,
        op: op.parse().map_err(|e| conversion(3, e))?,
        payload: json_column(row, 4)?,
        local_revision: row.get(5)?,
        base_revision: row.get(6)?,
        created_at: row.get(7)?,
    })
}
