//! Key-value store trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Failure while reading or writing the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The backing store itself failed (I/O, SQL, poisoned lock).
  #[error("cache store unavailable: {0}")]
  Backend(String),
  /// A stored value exists but could not be decoded.
  #[error("malformed cache entry for '{key}': {reason}")]
  Malformed { key: String, reason: String },
  /// A value could not be encoded for storage.
  #[error("failed to serialize cache entry: {0}")]
  Serialize(String),
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::Backend(e.to_string())
  }
}

/// Synchronous, string-keyed persistent store.
///
/// Every call may fail; callers treat the store as best-effort.
pub trait KeyValueStore: Send + Sync {
  /// Read the raw value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

  /// Overwrite the value stored under `key`.
  fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Store that doesn't keep anything.
/// Used when caching is disabled - every read misses.
pub struct NoopStore;

impl KeyValueStore for NoopStore {
  fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
    Ok(()) // Discard
  }
}

/// SQLite-backed key-value store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("heatdash").join("cache.db"))
  }
}

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_cache (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| StoreError::Backend(format!("lock poisoned: {}", e)))?;

    let value = conn
      .query_row(
        "SELECT value FROM kv_cache WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;

    Ok(value)
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| StoreError::Backend(format!("lock poisoned: {}", e)))?;

    conn.execute(
      "INSERT OR REPLACE INTO kv_cache (key, value, written_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;

    Ok(())
  }
}
