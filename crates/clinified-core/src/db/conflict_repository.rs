//! Conflict records kept for review and audit

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::models::{ConflictRecord, Payload, RecordId, RecordVersion, ResolutionOutcome};
use crate::util::now_ms;

const CONFLICT_COLUMNS: &str = "id, record_id, kind, local_version, remote_version, outcome, \
     resolved_payload, conflicting_fields, detected_at, resolved_at";

/// A conflict about to be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConflict {
    pub record_id: RecordId,
    pub kind: String,
    pub local: RecordVersion,
    pub remote: RecordVersion,
    pub outcome: ResolutionOutcome,
    pub resolved_payload: Option<Payload>,
    pub conflicting_fields: Vec<String>,
}

/// Trait for conflict storage operations
pub trait ConflictRepository {
    /// Store a conflict; resolved outcomes are stamped as resolved on insert
    fn insert(&self, conflict: &NewConflict) -> Result<ConflictRecord>;

    fn get(&self, id: i64) -> Result<ConflictRecord>;

    /// Conflicts newest first; open ones only unless `include_resolved`
    fn list(&self, include_resolved: bool, limit: usize) -> Result<Vec<ConflictRecord>>;

    /// The open conflict for a record, if any
    fn open_for_record(&self, record_id: &RecordId) -> Result<Option<ConflictRecord>>;

    /// The most recently detected conflict for a record, open or not
    fn latest_for_record(&self, record_id: &RecordId) -> Result<Option<ConflictRecord>>;

    fn count_open(&self) -> Result<usize>;

    /// Replace the remote side of an open conflict with a newer server version
    fn update_remote(&self, id: i64, remote: &RecordVersion) -> Result<()>;

    /// Close an open conflict with the chosen outcome
    fn mark_resolved(
        &self,
        id: i64,
        outcome: ResolutionOutcome,
        resolved_payload: Option<&Payload>,
    ) -> Result<ConflictRecord>;

    /// Remove a resolved conflict from the audit list
    fn dismiss(&self, id: i64) -> Result<()>;
}

/// `SQLite` implementation of `ConflictRepository`
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
        let record_id: String = row.get(1)?;
        let outcome: String = row.get(5)?;
        Ok(ConflictRecord {
            id: row.get(0)?,
            record_id: record_id
                .parse()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?,
            kind: row.get(2)?,
            local: json_value(row, 3)?,
            remote: json_value(row, 4)?,
            outcome: outcome
                .parse()
                .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?,
            resolved_payload: json_value(row, 6)?,
            conflicting_fields: json_value(row, 7)?,
            detected_at: row.get(8)?,
            resolved_at: row.get(9)?,
        })
    }
}

impl ConflictRepository for SqliteConflictRepository<'_> {
    fn insert(&self, conflict: &NewConflict) -> Result<ConflictRecord> {
        let detected_at = now_ms();
        let resolved_at = (conflict.outcome != ResolutionOutcome::Unresolved).then_some(detected_at);

        self.conn.execute(
            "INSERT INTO sync_conflicts (record_id, kind, local_version, remote_version, outcome,
                 resolved_payload, conflicting_fields, detected_at, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                conflict.record_id.as_str(),
                conflict.kind,
                serde_json::to_string(&conflict.local)?,
                serde_json::to_string(&conflict.remote)?,
                conflict.outcome.as_str(),
                conflict
                    .resolved_payload
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&conflict.conflicting_fields)?,
                detected_at,
                resolved_at,
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        tracing::info!(
            "Recorded {} conflict #{} for {} {}",
            conflict.outcome,
            id,
            conflict.kind,
            conflict.record_id
        );
        self.get(id)
    }

    fn get(&self, id: i64) -> Result<ConflictRecord> {
        self.conn
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?"),
                params![id],
                Self::parse_conflict,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))
    }

    fn list(&self, include_resolved: bool, limit: usize) -> Result<Vec<ConflictRecord>> {
        let filter = if include_resolved {
            ""
        } else {
            "WHERE resolved_at IS NULL"
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts {filter}
             ORDER BY detected_at DESC, id DESC
             LIMIT ?"
        ))?;

        let conflicts = stmt
            .query_map(params![limit as i64], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    fn open_for_record(&self, record_id: &RecordId) -> Result<Option<ConflictRecord>> {
        let conflict = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                     WHERE record_id = ? AND resolved_at IS NULL
                     ORDER BY id DESC LIMIT 1"
                ),
                params![record_id.as_str()],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    fn latest_for_record(&self, record_id: &RecordId) -> Result<Option<ConflictRecord>> {
        let conflict = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                     WHERE record_id = ?
                     ORDER BY id DESC LIMIT 1"
                ),
                params![record_id.as_str()],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    fn count_open(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_conflicts WHERE resolved_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn update_remote(&self, id: i64, remote: &RecordVersion) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE sync_conflicts SET remote_version = ? WHERE id = ? AND resolved_at IS NULL",
            params![serde_json::to_string(remote)?, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("open conflict {id}")));
        }
        Ok(())
    }

    fn mark_resolved(
        &self,
        id: i64,
        outcome: ResolutionOutcome,
        resolved_payload: Option<&Payload>,
    ) -> Result<ConflictRecord> {
        if outcome == ResolutionOutcome::Unresolved {
            return Err(Error::InvalidInput(
                "a conflict cannot be resolved as unresolved".to_string(),
            ));
        }

        let rows = self.conn.execute(
            "UPDATE sync_conflicts SET outcome = ?, resolved_payload = ?, resolved_at = ?
             WHERE id = ? AND resolved_at IS NULL",
            params![
                outcome.as_str(),
                resolved_payload.map(serde_json::to_string).transpose()?,
                now_ms(),
                id
            ],
        )?;
        if rows == 0 {
            // Distinguish "already resolved" from "missing"
            let existing = self.get(id)?;
            return Err(Error::InvalidInput(format!(
                "conflict {} was already resolved as {}",
                existing.id, existing.outcome
            )));
        }
        self.get(id)
    }

    fn dismiss(&self, id: i64) -> Result<()> {
        let conflict = self.get(id)?;
        if conflict.is_open() {
            return Err(Error::ConflictUnresolved(format!(
                "conflict {id} on {} {} must be resolved before it can be dismissed",
                conflict.kind, conflict.record_id
            )));
        }
        self.conn
            .execute("DELETE FROM sync_conflicts WHERE id = ?", params![id])?;
        Ok(())
    }
}

fn json_value<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: Option<String> = row.get(idx)?;
    serde_json::from_str(raw.as_deref().unwrap_or("null"))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
