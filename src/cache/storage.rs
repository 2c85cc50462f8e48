//! Synchronous key-value storage backends.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::error::StorageError;
use super::lock::mutex_lock;

/// Trait for synchronous, string-keyed storage backends.
///
/// Backends with a size limit report a full store as
/// [`StorageError::QuotaExceeded`].
pub trait KeyValueStore: Send + Sync {
  /// Read a slot.
  fn get(&self, slot: &str) -> Result<Option<String>, StorageError>;

  /// Replace the contents of a slot.
  fn set(&self, slot: &str, value: &str) -> Result<(), StorageError>;

  /// Remove a slot. Removing a missing slot is not an error.
  fn remove(&self, slot: &str) -> Result<(), StorageError>;
}

/// Storage implementation that doesn't store anything.
/// Used when durable storage is disabled; the cache runs memory-only.
pub struct NoopStorage;

impl KeyValueStore for NoopStorage {
  fn get(&self, _slot: &str) -> Result<Option<String>, StorageError> {
    Ok(None) // Always empty
  }

  fn set(&self, _slot: &str, _value: &str) -> Result<(), StorageError> {
    Err(StorageError::Unavailable("durable storage disabled".into()))
  }

  fn remove(&self, _slot: &str) -> Result<(), StorageError> {
    Ok(())
  }
}

/// In-process storage with an optional byte quota.
#[derive(Default)]
pub struct MemoryStorage {
  slots: Mutex<HashMap<String, String>>,
  quota_bytes: Option<usize>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      slots: Mutex::new(HashMap::new()),
      quota_bytes: Some(quota_bytes),
    }
  }
}

impl KeyValueStore for MemoryStorage {
  fn get(&self, slot: &str) -> Result<Option<String>, StorageError> {
    Ok(mutex_lock(&self.slots, "memory_get").get(slot).cloned())
  }

  fn set(&self, slot: &str, value: &str) -> Result<(), StorageError> {
    let mut slots = mutex_lock(&self.slots, "memory_set");
    if let Some(quota) = self.quota_bytes {
      let others: usize = slots
        .iter()
        .filter(|(k, _)| k.as_str() != slot)
        .map(|(_, v)| v.len())
        .sum();
      if others + value.len() > quota {
        return Err(StorageError::QuotaExceeded);
      }
    }
    slots.insert(slot.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, slot: &str) -> Result<(), StorageError> {
    mutex_lock(&self.slots, "memory_remove").remove(slot);
    Ok(())
  }
}

/// SQLite-based key-value storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  quota_bytes: Option<usize>,
}

impl SqliteStorage {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Unavailable(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StorageError::Unavailable(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// A throwaway store backed by an in-memory database.
  pub fn in_memory() -> Result<Self, StorageError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StorageError::Unavailable(format!("Failed to open memory database: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self, StorageError> {
    let storage = Self {
      conn: Mutex::new(conn),
      quota_bytes: None,
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Limit the total bytes stored across all slots.
  pub fn with_quota(mut self, quota_bytes: usize) -> Self {
    self.quota_bytes = Some(quota_bytes);
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("fetchcache").join("cache.db"))
  }

  /// Run database migrations for the key-value table.
  fn run_migrations(&self) -> Result<(), StorageError> {
    mutex_lock(&self.conn, "sqlite_migrate")
      .execute_batch(KV_SCHEMA)
      .map_err(|e| StorageError::Backend(format!("Failed to run cache migrations: {}", e)))
  }
}

/// Schema for the key-value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    slot TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStorage {
  fn get(&self, slot: &str) -> Result<Option<String>, StorageError> {
    let conn = mutex_lock(&self.conn, "sqlite_get");
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE slot = ?",
        params![slot],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| StorageError::Backend(format!("Failed to read slot {}: {}", slot, e)))
  }

  fn set(&self, slot: &str, value: &str) -> Result<(), StorageError> {
    let conn = mutex_lock(&self.conn, "sqlite_set");

    if let Some(quota) = self.quota_bytes {
      let others: i64 = conn
        .query_row(
          "SELECT COALESCE(SUM(LENGTH(value)), 0) FROM kv_store WHERE slot != ?",
          params![slot],
          |row| row.get(0),
        )
        .map_err(|e| StorageError::Backend(format!("Failed to measure storage: {}", e)))?;
      if others as usize + value.len() > quota {
        return Err(StorageError::QuotaExceeded);
      }
    }

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (slot, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![slot, value],
      )
      .map_err(|e| StorageError::Backend(format!("Failed to write slot {}: {}", slot, e)))?;

    Ok(())
  }

  fn remove(&self, slot: &str) -> Result<(), StorageError> {
    mutex_lock(&self.conn, "sqlite_remove")
      .execute("DELETE FROM kv_store WHERE slot = ?", params![slot])
      .map_err(|e| StorageError::Backend(format!("Failed to remove slot {}: {}", slot, e)))?;
    Ok(())
  }
}
