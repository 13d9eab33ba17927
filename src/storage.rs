//! Key/value storage trait and its SQLite implementation.
//!
//! Values are opaque JSON strings. The durable store backs the cache and
//! the error journal; an in-memory store backs session-scoped state such as
//! the circuit breaker ledger.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{StorageError, StorageResult};

/// Trait for key/value storage backends.
pub trait KeyValueStore: Send + Sync {
  /// Read the raw value stored under `key`.
  fn get(&self, key: &str) -> StorageResult<Option<String>>;

  /// Write `value` under `key`, replacing any previous value.
  fn set(&self, key: &str, value: &str) -> StorageResult<()>;

  /// Delete `key`. Deleting a missing key is not an error.
  fn remove(&self, key: &str) -> StorageResult<()>;

  /// List every key starting with `prefix`.
  fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// Storage implementation that doesn't keep anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl KeyValueStore for NoopStore {
  fn get(&self, _key: &str) -> StorageResult<Option<String>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &str) -> StorageResult<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> StorageResult<()> {
    Ok(())
  }

  fn keys_with_prefix(&self, _prefix: &str) -> StorageResult<Vec<String>> {
    Ok(Vec::new())
  }
}

/// SQLite-based key/value store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  /// Largest value accepted by `set`, in bytes
  max_value_bytes: Option<usize>,
}

impl SqliteStore {
  /// Open (or create) a durable store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a store that lives only as long as this process.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;

    Self::with_connection(conn)
  }

  /// Reject writes whose serialized value exceeds `limit` bytes.
  pub fn with_max_value_bytes(mut self, limit: usize) -> Self {
    self.max_value_bytes = Some(limit);
    self
  }

  /// Default location of the durable store.
  pub fn default_path(data_dir: &Path) -> PathBuf {
    data_dir.join("store.db")
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      max_value_bytes: None,
    })
  }

  fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Poisoned(e.to_string()))
  }
}

/// Schema for the key/value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> StorageResult<Option<String>> {
    let conn = self.lock()?;

    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;

    Ok(value)
  }

  fn set(&self, key: &str, value: &str) -> StorageResult<()> {
    if let Some(limit) = self.max_value_bytes {
      if value.len() > limit {
        return Err(StorageError::QuotaExceeded {
          key: key.to_string(),
          size: value.len(),
          limit,
        });
      }
    }

    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, written_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;

    Ok(())
  }

  fn remove(&self, key: &str) -> StorageResult<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
    let conn = self.lock()?;

    // substr instead of LIKE: keys may contain '%' and '_'
    let mut stmt = conn.prepare(
      "SELECT key FROM kv_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
    )?;

    let keys = stmt
      .query_map(params![prefix], |row| row.get(0))?
      .collect::<std::result::Result<Vec<String>, _>>()?;

    Ok(keys)
  }
}
