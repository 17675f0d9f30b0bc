//! Sync cycle summary

use serde::{Deserialize, Serialize};

/// How a sync cycle ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    #[default]
    Completed,
    /// Skipped because the device was offline
    Offline,
    /// Interrupted by cancellation or connectivity loss
    Cancelled,
    /// Finished, but transient failures exhausted their retry budget
    Degraded,
}

/// Counters reported to the UI after each cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Coalesced changes transmitted
    pub sent: usize,
    pub acknowledged: usize,
    pub conflicted: usize,
    pub failed: usize,
    /// Remote versions applied locally
    pub pulled: usize,
    pub status: CycleStatus,
    /// Cycle start (Unix ms)
    pub started_at: i64,
    /// Cycle end (Unix ms)
    pub finished_at: i64,
}

impl SyncSummary {
    #[must_use]
    pub fn started(started_at: i64) -> Self {
        Self {
            started_at,
            ..Self::default()
        }
    }

    /// True when the cycle moved nothing in either direction
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.sent == 0
            && self.acknowledged == 0
            && self.conflicted == 0
            && self.failed == 0
            && self.pulled == 0
    }
}
