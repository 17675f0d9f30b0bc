//! Database service used by the UI layer, the CLI and the orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use super::RecordLocks;
use crate::db::{
    ConflictRepository, Database, LocalStore, MetaRepository, SqliteConflictRepository,
    SqliteLocalStore, SqliteMetaRepository,
};
use crate::models::{ChangeRecord, ConflictRecord, Payload, Record, RecordId};
use crate::queue::{QueueCounts, SyncQueue};
use crate::resolver::ConflictState;
use crate::tracker::ChangeTracker;
use crate::Result;

/// Thread-safe service for local reads and tracked writes.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
    locks: RecordLocks,
    db_path: Option<PathBuf>,
}

impl DatabaseService {
    /// Open a database service at the given filesystem path.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            locks: RecordLocks::new(),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory database service (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            locks: RecordLocks::new(),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub(crate) async fn lock_db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().await
    }

    pub(crate) const fn record_locks(&self) -> &RecordLocks {
        &self.locks
    }

    /// Fetch a live record.
    pub async fn get_record(&self, id: &RecordId) -> Result<Record> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).get(id)
    }

    /// List live records, most recently modified first.
    pub async fn list_records(
        &self,
        kind: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).list(kind, limit, offset)
    }

    /// Records (tombstones included) changed after the given local revision.
    pub async fn list_modified_since(&self, revision: i64) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).list_modified_since(revision)
    }

    /// Create a record and queue it for sync.
    pub async fn create_record(&self, kind: &str, payload: Payload) -> Result<Record> {
        let db = self.db.lock().await;
        ChangeTracker::new(db.connection()).create(kind, payload)
    }

    /// Replace a record's payload and queue the change.
    pub async fn update_record(&self, id: &RecordId, payload: Payload) -> Result<Record> {
        let _guard = self.locks.lock(id).await;
        let db = self.db.lock().await;
        ChangeTracker::new(db.connection()).update(id, payload)
    }

    /// Tombstone a record and queue the deletion.
    pub async fn delete_record(&self, id: &RecordId) -> Result<Record> {
        let _guard = self.locks.lock(id).await;
        let db = self.db.lock().await;
        ChangeTracker::new(db.connection()).delete(id)
    }

    /// Unpruned change history of a record, oldest first.
    pub async fn record_history(&self, id: &RecordId) -> Result<Vec<ChangeRecord>> {
        let db = self.db.lock().await;
        ChangeTracker::new(db.connection()).history(id)
    }

    /// Conflicts newest first; open ones only unless `include_resolved`.
    pub async fn list_conflicts(
        &self,
        include_resolved: bool,
        limit: usize,
    ) -> Result<Vec<ConflictRecord>> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).list(include_resolved, limit)
    }

    pub async fn open_conflict_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).count_open()
    }

    /// Where a record stands in the conflict lifecycle.
    pub async fn conflict_state(&self, id: &RecordId) -> Result<ConflictState> {
        let db = self.db.lock().await;
        let conn = db.connection();
        SqliteLocalStore::new(conn).get(id)?;
        let latest = SqliteConflictRepository::new(conn).latest_for_record(id)?;
        let has_local_changes = SyncQueue::new(conn).has_local_changes(id)?;
        Ok(ConflictState::of_record(latest.as_ref(), has_local_changes))
    }

    pub async fn get_conflict(&self, id: i64) -> Result<ConflictRecord> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).get(id)
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        let db = self.db.lock().await;
        SyncQueue::new(db.connection()).counts()
    }

    /// Highest server revision pulled so far.
    pub async fn pull_cursor(&self) -> Result<i64> {
        let db = self.db.lock().await;
        SqliteMetaRepository::new(db.connection()).pull_cursor()
    }

    /// Stable device identifier, generated on first use.
    pub async fn device_id(&self) -> Result<String> {
        let db = self.db.lock().await;
        SqliteMetaRepository::new(db.connection()).device_id()
    }
}
