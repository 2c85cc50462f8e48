//! Cache entries and the in-memory entry store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use super::events::{CacheEvent, EventBus, EventKind};
use super::options::FetchOptions;

/// Default TTL for both freshness windows.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// A cached response.
///
/// Expiry timestamps are fixed when the entry is written and never
/// recomputed on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  /// Epoch ms after which plain reads treat the entry as stale
  pub expires_at: Option<i64>,
  /// Epoch ms after which prefill reads refresh from network
  pub prefill_expires_at: Option<i64>,
  /// Epoch ms when the value was last confirmed from network
  pub last_synced_at: i64,
  pub etag: Option<String>,
}

impl CacheEntry {
  /// Build an entry for `value`, computing both windows from `options`.
  pub fn new(
    key: &str,
    value: Value,
    options: &FetchOptions,
    now: i64,
    default_ttl_secs: u64,
    etag: Option<String>,
  ) -> Self {
    Self {
      key: key.to_string(),
      value,
      expires_at: options
        .expires
        .ttl_ms(default_ttl_secs)
        .map(|ttl| now.saturating_add(ttl)),
      prefill_expires_at: options
        .prefill_expires
        .ttl_ms(default_ttl_secs)
        .map(|ttl| now.saturating_add(ttl)),
      last_synced_at: options.last_sync.unwrap_or(now),
      etag,
    }
  }

  /// The same value with fresh windows, as after a "not modified" response.
  pub fn refreshed(&self, options: &FetchOptions, now: i64, default_ttl_secs: u64) -> Self {
    Self::new(
      &self.key,
      self.value.clone(),
      options,
      now,
      default_ttl_secs,
      self.etag.clone(),
    )
  }

  pub fn is_stale(&self, now: i64) -> bool {
    self.expires_at.is_some_and(|at| at <= now)
  }

  pub fn is_prefill_stale(&self, now: i64) -> bool {
    self.prefill_expires_at.is_some_and(|at| at <= now)
  }

  pub fn has_value(&self) -> bool {
    !self.value.is_null()
  }
}

/// In-memory mapping from cache key to entry.
///
/// Writing an entry schedules advisory expiry notifications. The timers
/// never remove anything; staleness is checked when the entry is next read.
#[derive(Debug)]
pub struct EntryStore {
  entries: HashMap<String, CacheEntry>,
  timers: HashMap<String, Vec<JoinHandle<()>>>,
  events: EventBus,
}

impl EntryStore {
  pub fn new(events: EventBus) -> Self {
    Self {
      entries: HashMap::new(),
      timers: HashMap::new(),
      events,
    }
  }

  pub fn get(&self, key: &str) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  /// Replace the entry for `entry.key`. Entries without a value are ignored.
  ///
  /// Must be called within a Tokio runtime when either window is set.
  pub fn set(&mut self, entry: CacheEntry, now: i64) -> bool {
    if !entry.has_value() {
      debug!(key = %entry.key, "Refusing to cache empty value");
      return false;
    }

    self.cancel_timers(&entry.key);

    let mut timers = Vec::new();
    if let Some(at) = entry.expires_at {
      timers.push(self.schedule(&entry, at - now, EventKind::CacheExpired));
    }
    if let Some(at) = entry.prefill_expires_at {
      timers.push(self.schedule(&entry, at - now, EventKind::CachePrefillExpired));
    }
    if !timers.is_empty() {
      self.timers.insert(entry.key.clone(), timers);
    }

    self.entries.insert(entry.key.clone(), entry);
    true
  }

  /// Insert entries restored from durable storage. No timers are scheduled.
  pub fn load(&mut self, entries: impl IntoIterator<Item = CacheEntry>) {
    for entry in entries.into_iter().filter(CacheEntry::has_value) {
      self.entries.insert(entry.key.clone(), entry);
    }
  }

  pub fn delete(&mut self, key: &str) -> Option<CacheEntry> {
    self.cancel_timers(key);
    self.entries.remove(key)
  }

  /// Drop every entry and cancel every pending notification.
  pub fn clear(&mut self) {
    self.stop_timers();
    self.entries.clear();
  }

  /// Cancel every pending notification, keeping the entries.
  pub fn stop_timers(&mut self) {
    for (_, handles) in self.timers.drain() {
      handles.iter().for_each(JoinHandle::abort);
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
    self.entries.values()
  }

  fn schedule(&self, entry: &CacheEntry, delay_ms: i64, kind: EventKind) -> JoinHandle<()> {
    let events = self.events.clone();
    let key = entry.key.clone();
    let value = entry.value.clone();
    let delay = Duration::from_millis(delay_ms.max(0) as u64);

    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      events.emit(CacheEvent::keyed(kind, &key, Some(value)));
    })
  }

  fn cancel_timers(&mut self, key: &str) {
    if let Some(handles) = self.timers.remove(key) {
      handles.iter().for_each(JoinHandle::abort);
    }
  }
}

impl Drop for EntryStore {
  fn drop(&mut self) {
    self.stop_timers();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::options::Expiry;
  use serde_json::json;

  fn entry(key: &str, options: &FetchOptions, now: i64) -> CacheEntry {
    CacheEntry::new(key, json!({"id": 1}), options, now, DEFAULT_TTL_SECS, None)
  }

  #[test]
  fn test_windows_fixed_at_write() {
    let options = FetchOptions::cached()
      .with_expires(Expiry::Seconds(60))
      .with_prefill_expires(Expiry::Never);
    let e = entry("/widgets/1", &options, 1_000);

    assert_eq!(e.expires_at, Some(61_000));
    assert_eq!(e.prefill_expires_at, None);
    assert_eq!(e.last_synced_at, 1_000);
  }

  #[test]
  fn test_default_ttl() {
    let e = entry("/a", &FetchOptions::cached(), 0);
    assert_eq!(e.expires_at, Some(300_000));
    assert_eq!(e.prefill_expires_at, Some(300_000));
  }

  #[test]
  fn test_expiry_boundary_is_inclusive() {
    let options = FetchOptions::cached().with_expires(Expiry::Seconds(10));
    let e = entry("/a", &options, 0);

    assert!(!e.is_stale(9_999));
    assert!(e.is_stale(10_000));
    assert!(e.is_prefill_stale(300_000));
  }

  #[test]
  fn test_never_expires() {
    let options = FetchOptions::cached().with_expires(Expiry::Never);
    let e = entry("/a", &options, 0);
    assert!(!e.is_stale(i64::MAX));
  }

  #[tokio::test(start_paused = true)]
  async fn test_huge_expiry_saturates() {
    let options = FetchOptions::cached()
      .with_expires(Expiry::Seconds(u64::MAX / 1000))
      .with_prefill_expires(Expiry::Seconds(u64::MAX));
    let e = entry("/a", &options, 1_000);
    assert_eq!(e.expires_at, Some(i64::MAX));
    assert_eq!(e.prefill_expires_at, Some(i64::MAX));
    assert!(!e.is_stale(i64::MAX - 1));

    let mut store = EntryStore::new(EventBus::new());
    assert!(store.set(e, 1_000));
    assert!(store.get("/a").is_some());
  }

  #[test]
  fn test_last_sync_override() {
    let mut options = FetchOptions::cached();
    options.last_sync = Some(42);
    assert_eq!(entry("/a", &options, 1_000).last_synced_at, 42);
  }

  #[tokio::test(start_paused = true)]
  async fn test_set_replaces_whole_entry() {
    let mut store = EntryStore::new(EventBus::new());
    let mut first = entry("/a", &FetchOptions::cached(), 0);
    first.etag = Some("v1".into());
    store.set(first, 0);

    let second = CacheEntry::new(
      "/a",
      json!({"name": "x"}),
      &FetchOptions::cached(),
      0,
      DEFAULT_TTL_SECS,
      None,
    );
    store.set(second.clone(), 0);

    assert_eq!(store.get("/a"), Some(&second));
    assert_eq!(store.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_empty_value_not_stored() {
    let mut store = EntryStore::new(EventBus::new());
    let empty = CacheEntry::new(
      "/a",
      Value::Null,
      &FetchOptions::cached(),
      0,
      DEFAULT_TTL_SECS,
      None,
    );
    assert!(!store.set(empty, 0));
    assert!(store.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_expiry_notifications() {
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let mut store = EntryStore::new(events);

    let options = FetchOptions::cached()
      .with_expires(Expiry::Seconds(1))
      .with_prefill_expires(Expiry::Seconds(2));
    store.set(entry("/a", &options, 0), 0);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.kind, EventKind::CacheExpired);
    assert_eq!(first.key.as_deref(), Some("/a"));

    let second = rx.recv().await.unwrap();
    assert_eq!(second.kind, EventKind::CachePrefillExpired);

    // Advisory only
    assert!(store.get("/a").is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_cancels_notifications() {
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let mut store = EntryStore::new(events.clone());

    let options = FetchOptions::cached().with_expires(Expiry::Seconds(1));
    store.set(entry("/a", &options, 0), 0);
    assert!(store.delete("/a").is_some());
    assert!(store.delete("/a").is_none());

    tokio::time::sleep(Duration::from_secs(600)).await;
    events.emit(CacheEvent::global(EventKind::PrefetchLoaded));
    assert_eq!(rx.recv().await.unwrap().kind, EventKind::PrefetchLoaded);
  }
}
