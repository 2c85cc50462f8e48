//! The cache engine context.
//!
//! One [`CacheEngine`] owns the entry store, persistence, the prefetch queue
//! and dispatcher, the in-flight counter and the process-wide switches.
//! Read and write interception live in the coordinator.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::entry::{CacheEntry, EntryStore};
use super::error::{FetchError, StorageError};
use super::events::{CacheEvent, EventBus};
use super::lock::mutex_lock;
use super::object_store::{MemoryObjectStore, ObjectStore, SqliteObjectStore};
use super::persistence::{PersistenceAdapter, PriorityFn};
use super::prefetch::{Dispatcher, PrefetchProcessor, PrefetchQueue, PrefetchRequest};
use super::storage::{KeyValueStore, MemoryStorage, NoopStorage, SqliteStorage};
use super::traits::Resource;
use super::transport::{InFlight, Request, Response, Transport};
use crate::config::{CacheConfig, StorageConfig};

/// Durable storage used by an engine.
#[derive(Clone)]
pub struct Backends {
  kv: Arc<dyn KeyValueStore>,
  objects: Option<Arc<dyn ObjectStore>>,
}

impl Backends {
  pub fn new(kv: Arc<dyn KeyValueStore>, objects: Option<Arc<dyn ObjectStore>>) -> Self {
    Self { kv, objects }
  }

  /// In-process storage, lost on exit.
  pub fn memory(quota_bytes: Option<usize>) -> Self {
    let kv = match quota_bytes {
      Some(quota) => MemoryStorage::with_quota(quota),
      None => MemoryStorage::new(),
    };
    Self::new(Arc::new(kv), Some(Arc::new(MemoryObjectStore::new())))
  }

  /// No durable storage; the cache runs memory-only.
  pub fn disabled() -> Self {
    Self::new(Arc::new(NoopStorage), None)
  }

  /// Both backends in one SQLite database file.
  pub fn sqlite(path: &Path, config: &CacheConfig) -> Result<Self, StorageError> {
    let mut kv = SqliteStorage::open(path)?;
    if let Some(quota) = config.storage_quota_bytes {
      kv = kv.with_quota(quota);
    }
    let objects = SqliteObjectStore::open(path, &config.prefetch_slot)?;
    Ok(Self::new(Arc::new(kv), Some(Arc::new(objects))))
  }

  /// Backends as configured. A database that cannot be opened degrades to
  /// memory-only caching.
  pub fn from_config(storage: &StorageConfig, config: &CacheConfig) -> Self {
    if storage.disabled {
      return Self::disabled();
    }

    let Some(path) = storage.path.clone().or_else(SqliteStorage::default_path) else {
      warn!("No data directory found, caching in memory only");
      return Self::disabled();
    };

    match Self::sqlite(&path, config) {
      Ok(backends) => {
        debug!(path = %path.display(), "Opened cache database");
        backends
      }
      Err(e) => {
        warn!(error = %e, "Cache database unavailable, caching in memory only");
        Self::disabled()
      }
    }
  }
}

/// Process-wide switches, adjustable at runtime.
#[derive(Debug)]
struct Switches {
  enabled: AtomicBool,
  prefetch: AtomicBool,
  use_object_store: AtomicBool,
  self_parameter: AtomicBool,
  revalidate: AtomicBool,
}

impl Switches {
  fn from_config(config: &CacheConfig) -> Self {
    Self {
      enabled: AtomicBool::new(config.enabled),
      prefetch: AtomicBool::new(config.prefetch),
      use_object_store: AtomicBool::new(config.use_object_store),
      self_parameter: AtomicBool::new(config.self_parameter),
      revalidate: AtomicBool::new(config.revalidate),
    }
  }
}

pub struct CacheEngine {
  pub(crate) settings: CacheConfig,
  switches: Switches,
  transport: Arc<dyn Transport>,
  pub(crate) entries: Mutex<EntryStore>,
  pub(crate) persistence: Arc<PersistenceAdapter>,
  pub(crate) prefetch: Arc<PrefetchQueue>,
  dispatcher: Arc<Dispatcher>,
  in_flight: InFlight,
  pub(crate) events: EventBus,
  pub(crate) clock: Clock,
  replay: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`CacheEngine`].
pub struct EngineBuilder {
  config: CacheConfig,
  transport: Arc<dyn Transport>,
  backends: Backends,
  clock: Option<Clock>,
  priority: Option<PriorityFn>,
  store_processor: Option<PrefetchProcessor>,
  retrieve_processor: Option<PrefetchProcessor>,
}

impl EngineBuilder {
  pub fn backends(mut self, backends: Backends) -> Self {
    self.backends = backends;
    self
  }

  pub fn clock(mut self, clock: Clock) -> Self {
    self.clock = Some(clock);
    self
  }

  /// Replace the eviction priority (earliest expiry first by default).
  pub fn priority(mut self, priority: PriorityFn) -> Self {
    self.priority = Some(priority);
    self
  }

  /// Transform prefetch requests before they are persisted.
  pub fn store_processor(mut self, processor: PrefetchProcessor) -> Self {
    self.store_processor = Some(processor);
    self
  }

  /// Transform prefetch requests after they are loaded.
  pub fn retrieve_processor(mut self, processor: PrefetchProcessor) -> Self {
    self.retrieve_processor = Some(processor);
    self
  }

  /// Create the engine: probe storage, load the stored snapshot and start
  /// prefetch replay when it is switched on.
  ///
  /// Must be called within a Tokio runtime.
  pub fn build(self) -> Arc<CacheEngine> {
    let config = self.config;
    let events = EventBus::new();
    let in_flight = InFlight::default();

    let mut persistence = PersistenceAdapter::new(
      self.backends.kv,
      self.backends.objects,
      &config.entry_slot,
      &config.prefetch_slot,
    );
    if let Some(priority) = self.priority {
      persistence = persistence.with_priority(priority);
    }
    let persistence = Arc::new(persistence);

    let mut entries = EntryStore::new(events.clone());
    if persistence.probe() {
      entries.load(persistence.load_entries());
    }

    let prefetch = Arc::new(
      PrefetchQueue::new(Arc::clone(&persistence), events.clone())
        .with_processors(self.store_processor, self.retrieve_processor),
    );
    let dispatcher = Arc::new(Dispatcher::new(
      in_flight.clone(),
      config.concurrency_budget,
      Duration::from_millis(config.backoff_ms),
      events.clone(),
    ));

    let engine = Arc::new(CacheEngine {
      switches: Switches::from_config(&config),
      settings: config,
      transport: self.transport,
      entries: Mutex::new(entries),
      persistence,
      prefetch,
      dispatcher,
      in_flight,
      events,
      clock: self.clock.unwrap_or_default(),
      replay: Mutex::new(None),
    });

    info!(
      entries = engine.entries().len(),
      prefetch = engine.prefetch_enabled(),
      "Cache engine ready"
    );

    if engine.prefetch_enabled() {
      engine.drain_and_replay();
    }
    engine
  }
}

impl CacheEngine {
  pub fn builder(config: CacheConfig, transport: Arc<dyn Transport>) -> EngineBuilder {
    let backends = Backends::memory(config.storage_quota_bytes);
    EngineBuilder {
      config,
      transport,
      backends,
      clock: None,
      priority: None,
      store_processor: None,
      retrieve_processor: None,
    }
  }

  /// Create an engine over `backends`. Must be called within a Tokio runtime.
  pub fn create(
    config: CacheConfig,
    transport: Arc<dyn Transport>,
    backends: Backends,
  ) -> Arc<Self> {
    Self::builder(config, transport).backends(backends).build()
  }

  pub fn is_enabled(&self) -> bool {
    self.switches.enabled.load(Ordering::SeqCst)
  }

  pub fn set_enabled(&self, enabled: bool) {
    self.switches.enabled.store(enabled, Ordering::SeqCst);
  }

  pub fn prefetch_enabled(&self) -> bool {
    self.switches.prefetch.load(Ordering::SeqCst)
  }

  /// Start capturing reads for replay, and replay what was captured before.
  pub fn enable_prefetch(self: &Arc<Self>) {
    if !self.switches.prefetch.swap(true, Ordering::SeqCst) {
      self.drain_and_replay();
    }
  }

  pub fn disable_prefetch(&self) {
    self.switches.prefetch.store(false, Ordering::SeqCst);
  }

  pub(crate) fn prefers_object_store(&self) -> bool {
    self.switches.use_object_store.load(Ordering::SeqCst)
  }

  pub fn set_use_object_store(&self, enabled: bool) {
    self.switches.use_object_store.store(enabled, Ordering::SeqCst);
  }

  pub fn set_self_parameter(&self, enabled: bool) {
    self.switches.self_parameter.store(enabled, Ordering::SeqCst);
  }

  pub(crate) fn revalidates(&self) -> bool {
    self.switches.revalidate.load(Ordering::SeqCst)
  }

  pub fn set_revalidate(&self, enabled: bool) {
    self.switches.revalidate.store(enabled, Ordering::SeqCst);
  }

  /// The resource handle to attach to results, if self-parameter mode is on.
  pub(crate) fn subject_for(&self, subject: &Arc<dyn Resource>) -> Option<Arc<dyn Resource>> {
    self
      .switches
      .self_parameter
      .load(Ordering::SeqCst)
      .then(|| Arc::clone(subject))
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  /// The entry cached under `key`, fresh or not.
  pub fn get_cache(&self, key: &str) -> Option<CacheEntry> {
    mutex_lock(&self.entries, "get_cache").get(key).cloned()
  }

  /// When the entry under `key` was last confirmed from network.
  pub fn get_last_sync(&self, key: &str) -> Option<i64> {
    mutex_lock(&self.entries, "get_last_sync")
      .get(key)
      .map(|e| e.last_synced_at)
  }

  /// Remove the entry under `key` from memory and durable storage.
  /// Returns whether anything was removed.
  pub fn clear_item(&self, key: &str) -> Result<bool, StorageError> {
    let removed = mutex_lock(&self.entries, "clear_item").delete(key).is_some();
    let persisted = self.persistence.remove_entry(key)?;
    if removed || persisted {
      debug!(%key, "Cleared cache entry");
    }
    Ok(removed || persisted)
  }

  /// All cached entries, ordered by key.
  pub fn entries(&self) -> Vec<CacheEntry> {
    let mut entries: Vec<_> = mutex_lock(&self.entries, "entries")
      .entries()
      .cloned()
      .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
  }

  pub fn now_ms(&self) -> i64 {
    self.clock.now_ms()
  }

  /// Network operations currently in flight, including replays.
  pub fn in_flight(&self) -> usize {
    self.in_flight.count()
  }

  /// Send a request through the transport, counted as in flight from the
  /// moment this is called until the response arrives.
  pub fn send_tracked(
    &self,
    request: Request,
  ) -> BoxFuture<'static, Result<Response, FetchError>> {
    let guard = self.in_flight.enter();
    let transport = Arc::clone(&self.transport);
    async move {
      let response = transport.send(request).await;
      drop(guard);
      response
    }
    .boxed()
  }

  /// Load the persisted prefetch set and replay it through the dispatcher,
  /// after the startup grace period.
  pub fn drain_and_replay(self: &Arc<Self>) {
    if !self.prefetch_enabled() {
      return;
    }

    let engine = Arc::clone(self);
    let grace = Duration::from_millis(self.settings.startup_grace_ms);
    let handle = tokio::spawn(async move {
      tokio::time::sleep(grace).await;

      let prefer_objects = engine.prefers_object_store();
      let requests = engine.prefetch.restore(prefer_objects).await;
      info!(requests = requests.len(), "Replaying prefetch requests");
      for (key, request) in requests.clone() {
        let replayer = Arc::clone(&engine);
        engine
          .dispatcher
          .submit(Box::new(move || replayer.replay(key, request)));
      }
      engine.prefetch.consume(&requests, prefer_objects);
      engine.dispatcher.start();
    });

    if let Some(previous) = mutex_lock(&self.replay, "drain_and_replay").replace(handle) {
      previous.abort();
    }
  }

  /// Fetch a prefetched request and cache the response. Skipped when the
  /// entry is still fresh.
  fn replay(self: &Arc<Self>, key: String, request: PrefetchRequest) {
    let now = self.clock.now_ms();
    let fresh = self
      .get_cache(&key)
      .is_some_and(|e| e.has_value() && !e.is_stale(now));
    if fresh {
      debug!(%key, "Prefetch entry still fresh, skipping replay");
      return;
    }

    let Some(outgoing) = Request::from_options(&request.options, None) else {
      warn!(%key, "Prefetch request has no URL, skipping");
      return;
    };

    debug!(%key, url = %outgoing.url, "Replaying prefetch request");
    let send = self.send_tracked(outgoing);
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      match send.await {
        Ok(response) if !response.is_not_modified() => {
          let stored = engine.write_through(
            &key,
            request.kind,
            request.options.url.clone(),
            &request.options,
            response.body,
            response.etag,
          );
          if let Err(e) = stored {
            warn!(%key, error = %e, "Failed to store prefetched response");
          }
        }
        Ok(_) => debug!(%key, "Prefetch replay not modified"),
        Err(e) => warn!(%key, error = %e, "Prefetch replay failed"),
      }
    });
  }

  /// Drop every entry, pending prefetch request and timer, and clear both
  /// durable slots.
  pub async fn reset(&self) -> Result<(), StorageError> {
    self.stop_background();
    mutex_lock(&self.entries, "reset").clear();
    self.prefetch.clear();
    self.persistence.clear_all().await?;
    info!("Cache reset");
    Ok(())
  }

  /// Stop every timer and background task. Entries stay readable.
  pub fn teardown(&self) {
    self.stop_background();
    mutex_lock(&self.entries, "teardown").stop_timers();
    debug!("Cache engine torn down");
  }

  fn stop_background(&self) {
    if let Some(handle) = mutex_lock(&self.replay, "stop_background").take() {
      handle.abort();
    }
    self.dispatcher.stop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::events::EventKind;
  use crate::cache::options::{Expiry, FetchOptions};
  use crate::cache::testing::{MockTransport, TestResource};
  use crate::cache::traits::ResourceKind;
  use serde_json::json;

  fn config() -> CacheConfig {
    CacheConfig::default()
  }

  fn prefetch_config() -> CacheConfig {
    CacheConfig {
      prefetch: true,
      ..CacheConfig::default()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_snapshot_loaded_on_create() {
    let backends = Backends::memory(None);
    let transport = Arc::new(MockTransport::new());

    let first = CacheEngine::create(config(), transport.clone(), backends.clone());
    let widget: Arc<dyn Resource> = Arc::new(TestResource::single("/widgets/1"));
    first
      .set_cache(widget.as_ref(), &FetchOptions::cached(), json!({"id": 1}))
      .unwrap();
    first.teardown();

    let second = CacheEngine::create(config(), transport, backends);
    let entry = second.get_cache("/widgets/1").unwrap();
    assert_eq!(entry.value, json!({"id": 1}));
    assert_eq!(second.get_last_sync("/widgets/1"), Some(entry.last_synced_at));
  }

  #[tokio::test(start_paused = true)]
  async fn test_unavailable_storage_runs_in_memory() {
    let engine = CacheEngine::create(
      config(),
      Arc::new(MockTransport::new()),
      Backends::disabled(),
    );
    let widget = TestResource::single("/widgets/1");
    assert!(engine
      .set_cache(&widget, &FetchOptions::cached(), json!({"id": 1}))
      .unwrap());
    assert!(engine.get_cache("/widgets/1").is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_item_is_idempotent() {
    let engine = CacheEngine::create(config(), Arc::new(MockTransport::new()), Backends::memory(None));
    let widget = TestResource::single("/widgets/1");
    engine
      .set_cache(&widget, &FetchOptions::cached(), json!({"id": 1}))
      .unwrap();

    assert!(engine.clear_item("/widgets/1").unwrap());
    assert!(!engine.clear_item("/widgets/1").unwrap());
    assert!(engine.get_cache("/widgets/1").is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_replay_after_grace_period() {
    let backends = Backends::memory(None);
    let transport = Arc::new(MockTransport::new());

    // A previous run recorded two reads
    let first = CacheEngine::create(prefetch_config(), transport.clone(), backends.clone());
    let mut rx = first.subscribe();
    let options = FetchOptions::cached().with_expires(Expiry::Seconds(1));
    for url in ["/a", "/b"] {
      let resource = TestResource::collection(url);
      first.set_cache(&resource, &options, json!([url])).unwrap();
    }
    while rx.recv().await.unwrap().kind != EventKind::PrefetchSaved {}
    first.teardown();

    let engine = CacheEngine::create(prefetch_config(), transport.clone(), backends);
    let mut rx = engine.subscribe();

    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert_eq!(transport.calls(), 0);

    loop {
      if rx.recv().await.unwrap().kind == EventKind::PrefetchLoaded {
        break;
      }
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(transport.calls_to("/a"), 1);
    assert_eq!(transport.calls_to("/b"), 1);
    assert!(engine.get_cache("/a").is_some());
    assert_eq!(
      engine.prefetch.pending()["/b"].kind,
      ResourceKind::Collection
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_replay_stays_within_budget() {
    let backends = Backends::memory(None);
    let recorder = Arc::new(MockTransport::new());

    let first = CacheEngine::create(prefetch_config(), recorder, backends.clone());
    let mut rx = first.subscribe();
    let options = FetchOptions::cached().with_expires(Expiry::Seconds(1));
    for url in ["/a", "/b", "/c", "/d", "/e"] {
      first
        .set_cache(&TestResource::single(url), &options, json!(url))
        .unwrap();
      while rx.recv().await.unwrap().kind != EventKind::PrefetchSaved {}
    }
    first.teardown();

    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_secs(3)));
    let engine = CacheEngine::create(prefetch_config(), transport.clone(), backends);
    let mut rx = engine.subscribe();
    while rx.recv().await.unwrap().kind != EventKind::PrefetchLoaded {}
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(transport.calls(), 5);
    assert!(transport.peak() <= 2);
    assert_eq!(engine.in_flight(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_replay_skips_fresh_entries() {
    let backends = Backends::memory(None);
    let transport = Arc::new(MockTransport::new());

    let first = CacheEngine::create(prefetch_config(), transport.clone(), backends.clone());
    let mut rx = first.subscribe();
    first
      .set_cache(&TestResource::single("/a"), &FetchOptions::cached(), json!(1))
      .unwrap();
    while rx.recv().await.unwrap().kind != EventKind::PrefetchSaved {}
    first.teardown();

    // The stored entry is loaded and still fresh
    let engine = CacheEngine::create(prefetch_config(), transport.clone(), backends);
    let mut rx = engine.subscribe();
    while rx.recv().await.unwrap().kind != EventKind::PrefetchLoaded {}

    tokio::time::sleep(Duration::from_millis(10)).await;

    // Scheduled requests are consumed even when the replay is skipped
    assert_eq!(transport.calls(), 0);
    assert!(engine.prefetch.pending().is_empty());
    assert!(engine.persistence.load_prefetch(false).await.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_enable_prefetch_starts_replay() {
    let engine = CacheEngine::create(config(), Arc::new(MockTransport::new()), Backends::memory(None));
    let mut rx = engine.subscribe();

    engine.enable_prefetch();
    assert!(engine.prefetch_enabled());
    // Empty queue still signals completion
    while rx.recv().await.unwrap().kind != EventKind::PrefetchLoaded {}

    engine.disable_prefetch();
    assert!(!engine.prefetch_enabled());
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_clears_everything() {
    let backends = Backends::memory(None);
    let engine = CacheEngine::create(prefetch_config(), Arc::new(MockTransport::new()), backends.clone());
    engine
      .set_cache(&TestResource::single("/a"), &FetchOptions::cached(), json!(1))
      .unwrap();

    engine.reset().await.unwrap();
    assert!(engine.entries().is_empty());
    assert!(engine.prefetch.pending().is_empty());

    let reopened = CacheEngine::create(config(), Arc::new(MockTransport::new()), backends);
    assert!(reopened.entries().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_teardown_stops_expiry_notifications() {
    let engine = CacheEngine::create(config(), Arc::new(MockTransport::new()), Backends::memory(None));
    let mut rx = engine.subscribe();
    engine
      .set_cache(&TestResource::single("/a"), &FetchOptions::cached(), json!(1))
      .unwrap();

    engine.teardown();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(rx.try_recv().is_err());
    assert!(engine.get_cache("/a").is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_send_tracked_counts_until_response() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(100)));
    let engine = CacheEngine::create(config(), transport, Backends::memory(None));

    let send = engine.send_tracked(Request {
      url: "/slow".into(),
      ..Request::default()
    });
    assert_eq!(engine.in_flight(), 1);
    send.await.unwrap();
    assert_eq!(engine.in_flight(), 0);
  }
}
