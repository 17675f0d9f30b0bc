//! Database layer for Clinified

mod conflict_repository;
mod connection;
mod meta_repository;
mod migrations;
mod record_store;

pub use conflict_repository::{ConflictRepository, NewConflict, SqliteConflictRepository};
pub use connection::Database;
pub use meta_repository::{MetaRepository, SqliteMetaRepository};
pub use record_store::{LocalStore, SqliteLocalStore};

pub(crate) use connection::with_transaction;
pub(crate) use record_store::json_column;
