//! Asynchronous transactional object stores.
//!
//! Used for the prefetch queue when the asynchronous backend is enabled.
//! A save clears the store and inserts the whole pending set as one record;
//! a load walks every record and keeps the last one.

use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::error::StorageError;
use super::lock::mutex_lock;

#[async_trait]
pub trait ObjectStore: Send + Sync {
  /// Clear the store, then insert `value` under `record_key`, atomically.
  async fn replace(&self, record_key: &str, value: String) -> Result<(), StorageError>;

  /// All record values, in key order.
  async fn scan(&self) -> Result<Vec<String>, StorageError>;

  async fn clear(&self) -> Result<(), StorageError>;
}

/// In-process object store.
#[derive(Default)]
pub struct MemoryObjectStore {
  records: Mutex<BTreeMap<String, String>>,
}

impl MemoryObjectStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
  async fn replace(&self, record_key: &str, value: String) -> Result<(), StorageError> {
    let mut records = mutex_lock(&self.records, "object_replace");
    records.clear();
    records.insert(record_key.to_string(), value);
    Ok(())
  }

  async fn scan(&self) -> Result<Vec<String>, StorageError> {
    Ok(
      mutex_lock(&self.records, "object_scan")
        .values()
        .cloned()
        .collect(),
    )
  }

  async fn clear(&self) -> Result<(), StorageError> {
    mutex_lock(&self.records, "object_clear").clear();
    Ok(())
  }
}

/// SQLite-backed object store. Work runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteObjectStore {
  conn: Arc<Mutex<Connection>>,
  store: String,
}

const OBJECT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS object_store (
    store TEXT NOT NULL,
    record_key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (store, record_key)
);
"#;

impl SqliteObjectStore {
  pub fn open(path: &Path, store: &str) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Unavailable(format!("Failed to create cache directory: {}", e))
      })?;
    }
    let conn = Connection::open(path).map_err(|e| {
      StorageError::Unavailable(format!(
        "Failed to open object store at {}: {}",
        path.display(),
        e
      ))
    })?;
    Self::with_connection(conn, store)
  }

  pub fn in_memory(store: &str) -> Result<Self, StorageError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StorageError::Unavailable(format!("Failed to open memory database: {}", e)))?;
    Self::with_connection(conn, store)
  }

  fn with_connection(conn: Connection, store: &str) -> Result<Self, StorageError> {
    conn
      .execute_batch(OBJECT_SCHEMA)
      .map_err(|e| StorageError::Unavailable(format!("Failed to run object store migrations: {}", e)))?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
      store: store.to_string(),
    })
  }

  async fn blocking<T, F>(&self, op: &'static str, f: F) -> Result<T, StorageError>
  where
    T: Send + 'static,
    F: FnOnce(&mut Connection, &str) -> Result<T, StorageError> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    let store = self.store.clone();
    tokio::task::spawn_blocking(move || {
      let mut conn = mutex_lock(&conn, op);
      f(&mut conn, &store)
    })
    .await
    .map_err(|e| StorageError::Unavailable(format!("Object store task failed: {}", e)))?
  }
}

#[async_trait]
impl ObjectStore for SqliteObjectStore {
  async fn replace(&self, record_key: &str, value: String) -> Result<(), StorageError> {
    let record_key = record_key.to_string();
    self
      .blocking("sqlite_object_replace", move |conn, store| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM object_store WHERE store = ?", params![store])?;
        tx.execute(
          "INSERT INTO object_store (store, record_key, value) VALUES (?, ?, ?)",
          params![store, record_key, value],
        )?;
        tx.commit()?;
        Ok(())
      })
      .await
  }

  async fn scan(&self) -> Result<Vec<String>, StorageError> {
    self
      .blocking("sqlite_object_scan", |conn, store| {
        let mut stmt =
          conn.prepare("SELECT value FROM object_store WHERE store = ? ORDER BY record_key")?;
        let values = stmt
          .query_map(params![store], |row| row.get(0))?
          .collect::<Result<Vec<String>, _>>()?;
        Ok(values)
      })
      .await
  }

  async fn clear(&self) -> Result<(), StorageError> {
    self
      .blocking("sqlite_object_clear", |conn, store| {
        conn.execute("DELETE FROM object_store WHERE store = ?", params![store])?;
        Ok(())
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_sqlite_replace_keeps_single_record() {
    let store = SqliteObjectStore::in_memory("fetchCacheHistory").unwrap();
    store.replace("a", "1".into()).await.unwrap();
    store.replace("b", "2".into()).await.unwrap();

    assert_eq!(store.scan().await.unwrap(), vec!["2".to_string()]);

    store.clear().await.unwrap();
    assert!(store.scan().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_memory_replace_keeps_single_record() {
    let store = MemoryObjectStore::new();
    store.replace("a", "1".into()).await.unwrap();
    store.replace("a", "3".into()).await.unwrap();
    assert_eq!(store.scan().await.unwrap(), vec!["3".to_string()]);
  }
}
