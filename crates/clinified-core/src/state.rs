//! Sync status shared with the UI layer

use serde::Serialize;

use crate::models::SyncSummary;

/// Coarse sync state for status indicators
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Offline,
    Syncing,
    Synced,
    Error,
}

/// Snapshot published on the orchestrator's status channel
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    /// Summary of the most recent finished cycle
    pub last_summary: Option<SyncSummary>,
    /// Error of the most recent failed cycle
    pub last_error: Option<String>,
}
