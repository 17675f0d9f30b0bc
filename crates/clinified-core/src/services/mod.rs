//! Async services shared by the UI layer, the CLI and the orchestrator

mod database;
mod record_locks;

pub use database::DatabaseService;
pub use record_locks::RecordLocks;
