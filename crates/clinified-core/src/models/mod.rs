//! Data models for Clinified

mod change;
mod conflict;
mod queue_entry;
mod record;
mod summary;

pub use change::{ChangeId, ChangeOp, ChangeRecord};
pub use conflict::{ConflictRecord, RecordVersion, ResolutionOutcome};
pub use queue_entry::{DeliveryState, SyncQueueEntry};
pub use record::{Payload, Record, RecordId};
pub use summary::{CycleStatus, SyncSummary};
