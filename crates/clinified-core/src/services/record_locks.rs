//! Per-record async locks
//!
//! UI edits and orchestrator write-backs take the record's lock before the
//! database lock, so a conflict resolution never interleaves with a live edit
//! of the same record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use crate::models::RecordId;

#[derive(Clone, Default)]
pub struct RecordLocks {
    locks: Arc<Mutex<HashMap<RecordId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a record
    pub async fn lock(&self, id: &RecordId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(*id).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of records currently locked or awaited
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}

impl std::fmt::Debug for RecordLocks {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RecordLocks")
            .field("active", &self.active())
            .finish()
    }
}
