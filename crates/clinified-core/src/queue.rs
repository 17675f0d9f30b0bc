//! Durable sync queue
//!
//! Delivery state lives in the `sync_queue` table, one row per logged change.
//! Draining coalesces all pending rows of a record into one transmittable
//! change while leaving every row (and its change record) in place until the
//! server acknowledges it.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::db::with_transaction;
use crate::error::Result;
use crate::models::{ChangeId, ChangeOp, ChangeRecord, DeliveryState, RecordId, SyncQueueEntry};
use crate::tracker::{parse_change, CHANGE_COLUMNS};
use crate::util::now_ms;

/// One record's coalesced pending changes, ready for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainedChange {
    pub record_id: RecordId,
    /// Every queue row folded into this transmission, oldest first
    pub entry_seqs: Vec<i64>,
    /// Effective operation after coalescing
    pub op: ChangeOp,
    /// Newest change; its payload is what gets sent
    pub change: ChangeRecord,
    /// Older change ids folded into `change`. A server that already applied
    /// one of them treats its revision as this change's base.
    pub supersedes: Vec<ChangeId>,
}

/// Number of queue rows per delivery state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub acknowledged: usize,
    pub failed: usize,
    pub conflicted: usize,
}

impl QueueCounts {
    /// Rows still waiting on delivery or intervention
    pub const fn outstanding(&self) -> usize {
        self.pending + self.in_flight + self.failed + self.conflicted
    }
}

/// Sync queue over a connection (or transaction)
pub struct SyncQueue<'a> {
    conn: &'a Connection,
}

impl<'a> SyncQueue<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append a pending entry for a freshly logged change
    pub fn enqueue(&self, change: &ChangeRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_queue (change_id, record_id, state, attempts, updated_at)
             VALUES (?, ?, 'pending', 0, ?)",
            params![change.id.as_str(), change.record_id.as_str(), now_ms()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Move up to `batch_size` records' pending entries to `in_flight`.
    ///
    /// Records are taken in FIFO order of their oldest pending entry. Records
    /// blocked on a conflict are skipped. A record created and deleted before
    /// ever reaching the server collapses to nothing and is settled locally.
    pub fn drain(&self, batch_size: usize) -> Result<Vec<DrainedChange>> {
        with_transaction(self.conn, |tx| {
            let queue = SyncQueue::new(tx);

            let mut stmt = tx.prepare(
                "SELECT record_id, MIN(seq) AS first_seq FROM sync_queue
                 WHERE state = 'pending'
                   AND record_id NOT IN (
                       SELECT record_id FROM sync_queue WHERE state IN ('conflicted', 'in_flight')
                   )
                 GROUP BY record_id
                 ORDER BY first_seq ASC
                 LIMIT ?",
            )?;
            let record_ids = stmt
                .query_map(params![batch_size as i64], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut drained = Vec::with_capacity(record_ids.len());
            for raw_id in record_ids {
                let entries = queue.entries_in_state(&raw_id, DeliveryState::Pending)?;
                let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
                    continue;
                };

                let never_synced =
                    first.change.op == ChangeOp::Create && last.change.base_revision.is_none();
                let seqs = entries.iter().map(|entry| entry.seq).collect::<Vec<_>>();

                if never_synced && last.change.op == ChangeOp::Delete {
                    tracing::debug!(
                        "Record {} was created and deleted offline; settling {} entries locally",
                        raw_id,
                        seqs.len()
                    );
                    queue.set_state(
                        &seqs,
                        DeliveryState::Acknowledged,
                        None,
                        None,
                        &[DeliveryState::Pending],
                    )?;
                    continue;
                }

                let op = if never_synced {
                    ChangeOp::Create
                } else {
                    last.change.op
                };
                queue.set_state(
                    &seqs,
                    DeliveryState::InFlight,
                    None,
                    None,
                    &[DeliveryState::Pending],
                )?;

                let supersedes = entries[..entries.len() - 1]
                    .iter()
                    .map(|entry| entry.change.id)
                    .collect();
                drained.push(DrainedChange {
                    record_id: last.change.record_id,
                    entry_seqs: seqs,
                    op,
                    change: last.change.clone(),
                    supersedes,
                });
            }

            Ok(drained)
        })
    }

    /// Mark entries acknowledged; already settled entries are left alone
    pub fn acknowledge(&self, seqs: &[i64]) -> Result<usize> {
        self.set_state(
            seqs,
            DeliveryState::Acknowledged,
            None,
            None,
            &[DeliveryState::Pending, DeliveryState::InFlight],
        )
    }

    /// Entries superseded by a conflict resolution; settled like acknowledgments
    pub fn resolve_entries(&self, seqs: &[i64]) -> Result<usize> {
        self.set_state(
            seqs,
            DeliveryState::Acknowledged,
            Some("superseded by conflict resolution"),
            None,
            &[
                DeliveryState::Pending,
                DeliveryState::InFlight,
                DeliveryState::Conflicted,
            ],
        )
    }

    /// Terminal failure, kept for audit. `attempts` are the sends made by the
    /// failed delivery and add to the entry's counter.
    pub fn mark_failed(&self, seqs: &[i64], reason: &str, attempts: u32) -> Result<usize> {
        self.set_state(
            seqs,
            DeliveryState::Failed,
            Some(reason),
            Some(attempts),
            &[DeliveryState::Pending, DeliveryState::InFlight],
        )
    }

    /// Block entries until the conflict is resolved manually
    pub fn mark_conflicted(&self, seqs: &[i64], reason: &str) -> Result<usize> {
        self.set_state(
            seqs,
            DeliveryState::Conflicted,
            Some(reason),
            None,
            &[DeliveryState::Pending, DeliveryState::InFlight],
        )
    }

    /// Return in-flight entries to `pending`, e.g. after a retryable failure
    pub fn release(&self, seqs: &[i64], reason: Option<&str>, attempts: u32) -> Result<usize> {
        self.set_state(
            seqs,
            DeliveryState::Pending,
            reason,
            Some(attempts),
            &[DeliveryState::InFlight],
        )
    }

    /// Return every in-flight entry to `pending` (cancellation, connectivity
    /// loss, startup recovery). Attempt counters are left untouched.
    pub fn requeue_in_flight(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE sync_queue SET state = 'pending', updated_at = ? WHERE state = 'in_flight'",
            params![now_ms()],
        )?;
        if rows > 0 {
            tracing::info!("Returned {rows} in-flight entries to pending");
        }
        Ok(rows)
    }

    /// Give failed entries a fresh retry budget
    pub fn retry_failed(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE sync_queue SET state = 'pending', attempts = 0, last_error = NULL, updated_at = ?
             WHERE state = 'failed'",
            params![now_ms()],
        )?;
        Ok(rows)
    }

    /// Delete acknowledged entries together with their change records
    pub fn prune_acknowledged(&self) -> Result<usize> {
        with_transaction(self.conn, |tx| {
            let pruned = tx.execute(
                "DELETE FROM change_log
                 WHERE id IN (SELECT change_id FROM sync_queue WHERE state = 'acknowledged')",
                [],
            )?;
            tx.execute("DELETE FROM sync_queue WHERE state = 'acknowledged'", [])?;
            Ok(pruned)
        })
    }

    /// All entries for a record, oldest first
    pub fn entries_for(&self, record_id: &RecordId) -> Result<Vec<SyncQueueEntry>> {
        self.query_entries(
            "WHERE q.record_id = ? ORDER BY q.seq ASC",
            params![record_id.as_str()],
        )
    }

    /// Pending entries for a record, oldest first
    pub fn pending_for(&self, record_id: &RecordId) -> Result<Vec<SyncQueueEntry>> {
        self.entries_in_state(&record_id.as_str(), DeliveryState::Pending)
    }

    /// Sequence numbers of entries that are not yet settled for a record
    pub fn unsettled_seqs(&self, record_id: &RecordId) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq FROM sync_queue
             WHERE record_id = ? AND state IN ('pending', 'in_flight', 'conflicted')
             ORDER BY seq ASC",
        )?;
        let seqs = stmt
            .query_map(params![record_id.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(seqs)
    }

    /// Whether the record has changes the server has not acknowledged
    pub fn has_local_changes(&self, record_id: &RecordId) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM sync_queue WHERE record_id = ? AND state != 'acknowledged'
             )",
            params![record_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Entries in a given state, oldest first
    pub fn list(&self, state: DeliveryState, limit: usize) -> Result<Vec<SyncQueueEntry>> {
        self.query_entries(
            "WHERE q.state = ? ORDER BY q.seq ASC LIMIT ?",
            params![state.as_str(), limit as i64],
        )
    }

    /// Row counts per state
    pub fn counts(&self) -> Result<QueueCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM sync_queue GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, usize>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            match state.parse::<DeliveryState>() {
                Ok(DeliveryState::Pending) => counts.pending = count,
                Ok(DeliveryState::InFlight) => counts.in_flight = count,
                Ok(DeliveryState::Acknowledged) => counts.acknowledged = count,
                Ok(DeliveryState::Failed) => counts.failed = count,
                Ok(DeliveryState::Conflicted) => counts.conflicted = count,
                Err(error) => tracing::warn!("Ignoring queue rows: {error}"),
            }
        }
        Ok(counts)
    }

    fn entries_in_state(&self, record_id: &str, state: DeliveryState) -> Result<Vec<SyncQueueEntry>> {
        self.query_entries(
            "WHERE q.record_id = ? AND q.state = ? ORDER BY q.seq ASC",
            params![record_id, state.as_str()],
        )
    }

    fn query_entries(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<SyncQueueEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHANGE_COLUMNS}, q.seq, q.state, q.attempts, q.last_error, q.updated_at
             FROM sync_queue q
             JOIN change_log c ON c.id = q.change_id
             {clause}"
        ))?;
        let entries = stmt
            .query_map(params, parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn set_state(
        &self,
        seqs: &[i64],
        state: DeliveryState,
        last_error: Option<&str>,
        attempts: Option<u32>,
        from: &[DeliveryState],
    ) -> Result<usize> {
        if seqs.is_empty() {
            return Ok(0);
        }

        let allowed = from
            .iter()
            .map(|state| format!("'{}'", state.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE sync_queue
             SET state = ?1,
                 last_error = COALESCE(?2, last_error),
                 attempts = attempts + COALESCE(?3, 0),
                 updated_at = ?4
             WHERE seq = ?5 AND state IN ({allowed})"
        );

        let now = now_ms();
        with_transaction(self.conn, |tx| {
            let mut stmt = tx.prepare(&sql)?;
            let mut changed = 0;
            for seq in seqs {
                changed += stmt.execute(params![state.as_str(), last_error, attempts, now, seq])?;
            }
            Ok(changed)
        })
    }
}

fn parse_entry(row: &Row<'_>) -> rusqlite::Result<SyncQueueEntry> {
    let change = parse_change(row)?;
    let state: String = row.get(9)?;
    Ok(SyncQueueEntry {
        seq: row.get(8)?,
        change,
        state: state
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, e.into()))?,
        attempts: row.get(10)?,
        last_error: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Payload;
    use crate::tracker::ChangeTracker;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn drain_coalesces_pending_changes_per_record() {
        let db = Database::open_in_memory().unwrap();
        let tracker = ChangeTracker::new(db.connection());
        let queue = SyncQueue::new(db.connection());

        let record = tracker.create("patient", payload(json!({"name": "A"}))).unwrap();
        tracker.update(&record.id, payload(json!({"name": "B"}))).unwrap();

        let drained = queue.drain(10).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].entry_seqs.len(), 2);
        assert_eq!(drained[0].op, ChangeOp::Create);
        assert_eq!(drained[0].change.payload["name"], "B");

        // History is still intact until acknowledgment
        let history = tracker.history(&record.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(drained[0].supersedes, vec![history[0].id]);
        let counts = queue.counts().unwrap();
        assert_eq!(counts.in_flight, 2);
        assert_eq!(counts.pending, 0);
    }

    #[test]
    fn drain_respects_batch_size_and_fifo_order() {
        let db = Database::open_in_memory().unwrap();
        let tracker = ChangeTracker::new(db.connection());
        let queue = SyncQueue::new(db.connection());

        let first = tracker.create("patient", payload(json!({"n": 1}))).unwrap();
        let second = tracker.create("patient", payload(json!({"n": 2}))).unwrap();
        let third = tracker.create("patient", payload(json!({"n": 3}))).unwrap();
        tracker.update(&first.id, payload(json!({"n": 10}))).unwrap();

        let batch = queue.drain(2).unwrap();
        let ids = batch.iter().map(|d| d.record_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![first.id, second.id]);

        let rest = queue.drain(2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].record_id, third.id);
        assert!(queue.drain(2).unwrap().is_empty());
    }

    #[test]
    fn drain_collapses_offline_create_then_delete() {
        let db = Database::open_in_memory().unwrap();
        let tracker = ChangeTracker::new(db.connection());
        let queue = SyncQueue::new(db.connection());

        let record = tracker.create("patient", payload(json!({"name": "tmp"}))).unwrap();
        tracker.delete(&record.id).unwrap();

        assert!(queue.drain(10).unwrap().is_empty());
        assert_eq!(queue.counts().unwrap().acknowledged, 2);
        queue.prune_acknowledged().unwrap();
        assert!(tracker.history(&record.id).unwrap().is_empty());
    }

    #[test]
    fn synced_record_update_keeps_its_operation() {
        let db = Database::open_in_memory().unwrap();
        let tracker = ChangeTracker::new(db.connection());
        let queue = SyncQueue::new(db.connection());

        let record = tracker.create("patient", payload(json!({"name": "A"}))).unwrap();
        let drained = queue.drain(10).unwrap();
        queue.acknowledge(&drained[0].entry_seqs).unwrap();
        tracker
            .commit_acknowledged(&record.id, 1, &record.payload)
            .unwrap();
        queue.prune_acknowledged().unwrap();

        tracker.delete(&record.id).unwrap();
        let drained = queue.drain(10).unwrap();
        assert_eq!(drained[0].op, ChangeOp::Delete);
        assert_eq!(drained[0].change.base_revision, Some(1));
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let tracker = ChangeTracker::new(db.connection());
        let queue = SyncQueue::new(db.connection());

        tracker.create("patient", payload(json!({"name": "A"}))).unwrap();
        let drained = queue.drain(10).unwrap();
        let seqs = drained[0].entry_seqs.clone();

        assert_eq!(queue.acknowledge(&seqs).unwrap(), 1);
        assert_eq!(queue.acknowledge(&seqs).unwrap(), 0);
        assert_eq!(queue.prune_acknowledged().unwrap(), 1);
        assert_eq!(queue.acknowledge(&seqs).unwrap(), 0);
        assert_eq!(queue.counts().unwrap(), QueueCounts::default());
    }

    #[test]
    fn requeue_returns_in_flight_entries_to_pending() {
        let db = Database::open_in_memory().unwrap();
        let tracker = ChangeTracker::new(db.connection());
        let queue = SyncQueue::new(db.connection());

        tracker.create("patient", payload(json!({"name": "A"}))).unwrap();
        tracker.create("encounter", payload(json!({"status": "planned"}))).unwrap();
        queue.drain(10).unwrap();

        assert_eq!(queue.requeue_in_flight().unwrap(), 2);
        let counts = queue.counts().unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.failed, 0);
        assert_eq!(queue.drain(10).unwrap().len(), 2);
    }

    #[test]
    fn conflicted_records_are_not_drained() {
        let db = Database::open_in_memory().unwrap();
        let tracker = ChangeTracker::new(db.connection());
        let queue = SyncQueue::new(db.connection());

        let blocked = tracker.create("patient", payload(json!({"name": "A"}))).unwrap();
        let other = tracker.create("patient", payload(json!({"name": "B"}))).unwrap();
        let drained = queue.drain(1).unwrap();
        queue
            .mark_conflicted(&drained[0].entry_seqs, "needs review")
            .unwrap();

        tracker.update(&blocked.id, payload(json!({"name": "A2"}))).unwrap();
        let next = queue.drain(10).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].record_id, other.id);

        let seqs = queue.unsettled_seqs(&blocked.id).unwrap();
        assert_eq!(seqs.len(), 2);
        assert_eq!(queue.resolve_entries(&seqs).unwrap(), 2);
    }

    #[test]
    fn failed_entries_keep_reason_until_retried() {
        let db = Database::open_in_memory().unwrap();
        let tracker = ChangeTracker::new(db.connection());
        let queue = SyncQueue::new(db.connection());

        let record = tracker.create("patient", payload(json!({"name": "A"}))).unwrap();
        let drained = queue.drain(10).unwrap();
        queue
            .mark_failed(&drained[0].entry_seqs, "missing field", 1)
            .unwrap();

        let entries = queue.entries_for(&record.id).unwrap();
        assert_eq!(entries[0].state, DeliveryState::Failed);
        assert_eq!(entries[0].last_error.as_deref(), Some("missing field"));
        assert!(queue.drain(10).unwrap().is_empty());

        assert_eq!(queue.retry_failed().unwrap(), 1);
        let entries = queue.entries_for(&record.id).unwrap();
        assert_eq!(entries[0].state, DeliveryState::Pending);
        assert_eq!(entries[0].attempts, 0);
    }
}
