//! SQLite-backed [`Storage`] and its schema.

use crate::wallet::Storage;
use crate::{LabelSyncError, Result};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Wallet storage in a single SQLite file
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Open (and initialize if needed) a storage file at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = Self { conn };
        storage.initialize_schema()?;
        Ok(storage)
    }

    /// Create a new in-memory storage for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            )",
            [],
        )?;
        self.conn
            .pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
        Ok(())
    }

    /// Schema version recorded in the file
    pub fn schema_version(&self) -> Result<i32> {
        let version = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }
}

impl Storage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;

        raw.map(|text| {
            serde_json::from_str(&text).map_err(|e| {
                LabelSyncError::Storage(format!("Corrupt value for '{}': {}", key, e))
            })
        })
        .transpose()
    }

    fn put(&mut self, key: &str, value: Value) -> Result<()> {
        let text =
            serde_json::to_string(&value).map_err(|e| LabelSyncError::Storage(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, text],
        )?;
        Ok(())
    }
}
