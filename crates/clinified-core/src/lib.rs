//! clinified-core - Core library for Clinified
//!
//! This crate contains the offline-first synchronization engine used by the
//! Clinified clients: the durable local record store, the change tracker, the
//! coalescing sync queue, the batch transport client, the conflict resolver and
//! the orchestrator that drives a sync cycle.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod resolver;
pub mod services;
pub mod state;
pub mod tracker;
pub mod transport;
pub mod util;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::{
    ChangeId, ChangeOp, ChangeRecord, ConflictRecord, DeliveryState, Payload, Record, RecordId,
    ResolutionOutcome, SyncQueueEntry, SyncSummary,
};
pub use orchestrator::{ConflictChoice, SyncHandle, SyncOrchestrator};
pub use services::DatabaseService;
