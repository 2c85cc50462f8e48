//! Durable persistence for cache entries and the prefetch queue.
//!
//! Entries always go to the synchronous key-value backend as one JSON
//! snapshot. The prefetch queue goes to the asynchronous object store when
//! it is enabled and working, and to the key-value backend otherwise.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::entry::CacheEntry;
use super::error::StorageError;
use super::lock::mutex_lock;
use super::object_store::ObjectStore;
use super::prefetch::PrefetchRequest;
use super::storage::KeyValueStore;

const PROBE_SLOT: &str = "fetchCache_probe";
const PREFETCH_RECORD: &str = "fetchCachePrefetch";

/// Eviction priority. The entry ordered first is evicted first.
pub type PriorityFn = Arc<dyn Fn(&CacheEntry, &CacheEntry) -> Ordering + Send + Sync>;

/// Earliest expiry first.
pub fn earliest_expiry_first(a: &CacheEntry, b: &CacheEntry) -> Ordering {
  match (a.expires_at, b.expires_at) {
    (Some(x), Some(y)) => x.cmp(&y),
    // Entries without expiry are kept
    (Some(_), None) => Ordering::Less,
    (None, Some(_)) => Ordering::Greater,
    (None, None) => Ordering::Equal,
  }
}

pub type PrefetchSet = BTreeMap<String, PrefetchRequest>;

pub struct PersistenceAdapter {
  kv: Arc<dyn KeyValueStore>,
  kv_available: AtomicBool,
  objects: Option<Arc<dyn ObjectStore>>,
  objects_supported: AtomicBool,
  /// Serialized view of the entries, keyed by cache key
  snapshot: Mutex<BTreeMap<String, CacheEntry>>,
  entry_slot: String,
  prefetch_slot: String,
  priority: PriorityFn,
}

impl PersistenceAdapter {
  pub fn new(
    kv: Arc<dyn KeyValueStore>,
    objects: Option<Arc<dyn ObjectStore>>,
    entry_slot: &str,
    prefetch_slot: &str,
  ) -> Self {
    Self {
      kv,
      kv_available: AtomicBool::new(true),
      objects,
      objects_supported: AtomicBool::new(true),
      snapshot: Mutex::new(BTreeMap::new()),
      entry_slot: entry_slot.to_string(),
      prefetch_slot: prefetch_slot.to_string(),
      priority: Arc::new(earliest_expiry_first),
    }
  }

  pub fn with_priority(mut self, priority: PriorityFn) -> Self {
    self.priority = priority;
    self
  }

  /// Check that the key-value backend accepts writes.
  ///
  /// A failing backend is marked unavailable and the cache runs memory-only.
  pub fn probe(&self) -> bool {
    let ok = self
      .kv
      .set(PROBE_SLOT, PROBE_SLOT)
      .and_then(|_| self.kv.remove(PROBE_SLOT));
    match ok {
      Ok(()) => true,
      Err(e) => {
        warn!(error = %e, "Durable storage unavailable, caching in memory only");
        self.kv_available.store(false, AtomicOrdering::SeqCst);
        false
      }
    }
  }

  pub fn is_available(&self) -> bool {
    self.kv_available.load(AtomicOrdering::SeqCst)
  }

  /// Load the stored entry snapshot. Malformed data loads as empty.
  pub fn load_entries(&self) -> Vec<CacheEntry> {
    if !self.is_available() {
      return Vec::new();
    }

    let json = match self.kv.get(&self.entry_slot) {
      Ok(Some(json)) => json,
      Ok(None) => return Vec::new(),
      Err(e) => {
        warn!(error = %e, "Failed to read cache snapshot");
        return Vec::new();
      }
    };

    let parsed: BTreeMap<String, CacheEntry> = match serde_json::from_str(&json) {
      Ok(parsed) => parsed,
      Err(e) => {
        warn!(error = %e, "Ignoring malformed cache snapshot");
        BTreeMap::new()
      }
    };

    info!(entries = parsed.len(), "Loaded cache snapshot");
    let entries = parsed.values().cloned().collect();
    *mutex_lock(&self.snapshot, "load_entries") = parsed;
    entries
  }

  /// Record an entry and save the snapshot.
  pub fn write_entry(&self, entry: &CacheEntry) -> Result<(), StorageError> {
    let mut snapshot = mutex_lock(&self.snapshot, "write_entry");
    snapshot.insert(entry.key.clone(), entry.clone());
    self.save_snapshot(&mut snapshot)
  }

  /// Drop an entry. Returns false (and writes nothing) if it was not stored.
  pub fn remove_entry(&self, key: &str) -> Result<bool, StorageError> {
    let mut snapshot = mutex_lock(&self.snapshot, "remove_entry");
    if snapshot.remove(key).is_none() {
      return Ok(false);
    }
    self.save_snapshot(&mut snapshot)?;
    Ok(true)
  }

  pub fn stored_keys(&self) -> Vec<String> {
    mutex_lock(&self.snapshot, "stored_keys").keys().cloned().collect()
  }

  /// Write the snapshot. On a full store, evict one entry by priority and
  /// retry once.
  fn save_snapshot(&self, snapshot: &mut BTreeMap<String, CacheEntry>) -> Result<(), StorageError> {
    if !self.is_available() {
      return Ok(());
    }

    match self.put(&self.entry_slot, &*snapshot) {
      Err(StorageError::QuotaExceeded) => {
        let Some(victim) = self.select_victim(snapshot) else {
          warn!("Cache storage full and nothing is evictable");
          return Ok(());
        };
        info!(key = %victim, "Cache storage full, evicting entry");
        snapshot.remove(&victim);

        match self.put(&self.entry_slot, &*snapshot) {
          Err(StorageError::QuotaExceeded) => {
            warn!(entries = snapshot.len(), "Cache storage still full after eviction");
            Ok(())
          }
          other => self.settle(other),
        }
      }
      other => self.settle(other),
    }
  }

  /// The entry to evict: among entries with an expiry, the first by priority.
  pub fn select_victim(&self, snapshot: &BTreeMap<String, CacheEntry>) -> Option<String> {
    snapshot
      .values()
      .filter(|entry| entry.expires_at.is_some())
      .min_by(|a, b| (self.priority)(a, b))
      .map(|entry| entry.key.clone())
  }

  fn put<T: serde::Serialize>(&self, slot: &str, data: &T) -> Result<(), StorageError> {
    let json = serde_json::to_string(data)?;
    self.kv.set(slot, &json)
  }

  /// Unavailable backends degrade to memory-only; anything else propagates.
  fn settle(&self, result: Result<(), StorageError>) -> Result<(), StorageError> {
    match result {
      Err(StorageError::Unavailable(reason)) => {
        warn!(%reason, "Durable storage became unavailable, caching in memory only");
        self.kv_available.store(false, AtomicOrdering::SeqCst);
        Ok(())
      }
      other => other,
    }
  }

  fn objects(&self, prefer_objects: bool) -> Option<&Arc<dyn ObjectStore>> {
    if prefer_objects && self.objects_supported.load(AtomicOrdering::SeqCst) {
      self.objects.as_ref()
    } else {
      None
    }
  }

  fn object_store_failed(&self, error: &StorageError) {
    warn!(error = %error, "Object store unavailable, falling back to key-value storage");
    self.objects_supported.store(false, AtomicOrdering::SeqCst);
  }

  /// Persist the pending prefetch set.
  pub async fn save_prefetch(
    &self,
    requests: &PrefetchSet,
    prefer_objects: bool,
  ) -> Result<(), StorageError> {
    if let Some(objects) = self.objects(prefer_objects) {
      let json = serde_json::to_string(requests)?;
      match objects.replace(PREFETCH_RECORD, json).await {
        Ok(()) => {
          debug!(requests = requests.len(), "Saved prefetch queue to object store");
          return Ok(());
        }
        Err(e) => self.object_store_failed(&e),
      }
    }

    if !self.is_available() {
      return Ok(());
    }

    match self.put(&self.prefetch_slot, requests) {
      Err(StorageError::QuotaExceeded) => {
        // Drop the oldest request and retry once
        let mut trimmed = requests.clone();
        let oldest = trimmed
          .values()
          .min_by_key(|r| r.saved_at)
          .map(|r| r.key.clone());
        if let Some(oldest) = oldest {
          info!(key = %oldest, "Prefetch storage full, dropping oldest request");
          trimmed.remove(&oldest);
        }
        match self.put(&self.prefetch_slot, &trimmed) {
          Err(StorageError::QuotaExceeded) => {
            warn!("Prefetch storage still full, queue not saved");
            Ok(())
          }
          other => self.settle(other),
        }
      }
      other => self.settle(other),
    }
  }

  /// Load the persisted prefetch set, object store first.
  pub async fn load_prefetch(&self, prefer_objects: bool) -> PrefetchSet {
    if let Some(objects) = self.objects(prefer_objects) {
      match objects.scan().await {
        // The store holds a single record; the last one read wins
        Ok(records) => {
          return records
            .last()
            .map(|json| parse_prefetch(json))
            .unwrap_or_default();
        }
        Err(e) => self.object_store_failed(&e),
      }
    }

    if !self.is_available() {
      return PrefetchSet::new();
    }

    match self.kv.get(&self.prefetch_slot) {
      Ok(Some(json)) => parse_prefetch(&json),
      Ok(None) => PrefetchSet::new(),
      Err(e) => {
        warn!(error = %e, "Failed to read prefetch queue");
        PrefetchSet::new()
      }
    }
  }

  /// Remove everything this adapter has persisted.
  pub async fn clear_all(&self) -> Result<(), StorageError> {
    mutex_lock(&self.snapshot, "clear_all").clear();
    if let Some(objects) = &self.objects {
      if let Err(e) = objects.clear().await {
        self.object_store_failed(&e);
      }
    }
    if self.is_available() {
      self.kv.remove(&self.entry_slot)?;
      self.kv.remove(&self.prefetch_slot)?;
    }
    Ok(())
  }
}

fn parse_prefetch(json: &str) -> PrefetchSet {
  serde_json::from_str(json).unwrap_or_else(|e| {
    warn!(error = %e, "Ignoring malformed prefetch queue");
    PrefetchSet::new()
  })
}
