//! Device-local sync metadata

use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};

const DEVICE_ID_KEY: &str = "device_id";
const PULL_CURSOR_KEY: &str = "pull_cursor";

/// Trait for sync metadata storage operations
pub trait MetaRepository {
    /// Stable identifier of this device, generated on first use
    fn device_id(&self) -> Result<String>;

    /// Highest server revision already pulled
    fn pull_cursor(&self) -> Result<i64>;

    /// Persist the pull cursor
    fn set_pull_cursor(&self, cursor: i64) -> Result<()>;
}

/// `SQLite` implementation of `MetaRepository`
pub struct SqliteMetaRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMetaRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn get_value(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }
}

impl MetaRepository for SqliteMetaRepository<'_> {
    fn device_id(&self) -> Result<String> {
        if let Some(id) = self.get_value(DEVICE_ID_KEY)? {
            return Ok(id);
        }

        let id = uuid::Uuid::now_v7().to_string();
        self.set_value(DEVICE_ID_KEY, &id)?;
        tracing::info!("Generated device id {id}");
        Ok(id)
    }

    fn pull_cursor(&self) -> Result<i64> {
        Ok(self
            .get_value(PULL_CURSOR_KEY)?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    fn set_pull_cursor(&self, cursor: i64) -> Result<()> {
        self.set_value(PULL_CURSOR_KEY, &cursor.to_string())
    }
}
