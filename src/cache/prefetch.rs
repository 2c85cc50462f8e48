//! Prefetch capture and replay.
//!
//! Cached reads are recorded as [`PrefetchRequest`]s and persisted. On the
//! next start they are replayed through a [`Dispatcher`] that only starts a
//! request while the engine-wide in-flight count is under budget.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::events::{CacheEvent, EventBus, EventKind};
use super::lock::mutex_lock;
use super::options::{FetchOptions, Hooks};
use super::persistence::{PersistenceAdapter, PrefetchSet};
use super::traits::ResourceKind;
use super::transport::InFlight;

/// A read recorded for replay on a future start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchRequest {
  pub key: String,
  pub kind: ResourceKind,
  pub options: FetchOptions,
  /// Epoch ms when the request was recorded
  pub saved_at: i64,
}

impl PrefetchRequest {
  /// Record a read. Callbacks are stripped and the resource URL is pinned
  /// into the options so the request can be replayed without the resource.
  pub fn new(
    key: &str,
    kind: ResourceKind,
    options: &FetchOptions,
    resource_url: Option<String>,
    saved_at: i64,
  ) -> Self {
    let mut options = options.clone();
    options.hooks = Hooks::default();
    if options.url.is_none() {
      options.url = resource_url;
    }

    Self {
      key: key.to_string(),
      kind,
      options,
      saved_at,
    }
  }
}

/// Transform applied to requests on their way to or from storage.
pub type PrefetchProcessor = Arc<dyn Fn(PrefetchRequest) -> PrefetchRequest + Send + Sync>;

/// Pending prefetch requests, keyed by cache key.
pub struct PrefetchQueue {
  pending: Mutex<PrefetchSet>,
  persistence: Arc<PersistenceAdapter>,
  events: EventBus,
  saving: AtomicBool,
  dirty: AtomicBool,
  store_processor: Option<PrefetchProcessor>,
  retrieve_processor: Option<PrefetchProcessor>,
}

impl PrefetchQueue {
  pub fn new(persistence: Arc<PersistenceAdapter>, events: EventBus) -> Self {
    Self {
      pending: Mutex::new(PrefetchSet::new()),
      persistence,
      events,
      saving: AtomicBool::new(false),
      dirty: AtomicBool::new(false),
      store_processor: None,
      retrieve_processor: None,
    }
  }

  pub fn with_processors(
    mut self,
    store: Option<PrefetchProcessor>,
    retrieve: Option<PrefetchProcessor>,
  ) -> Self {
    self.store_processor = store;
    self.retrieve_processor = retrieve;
    self
  }

  /// Record a request and persist the pending set.
  pub fn enqueue(self: &Arc<Self>, request: PrefetchRequest, prefer_objects: bool) {
    let request = match &self.store_processor {
      Some(process) => process(request),
      None => request,
    };
    debug!(key = %request.key, "Recording prefetch request");
    mutex_lock(&self.pending, "prefetch_enqueue").insert(request.key.clone(), request);
    self.persist(prefer_objects);
  }

  pub fn pending(&self) -> PrefetchSet {
    mutex_lock(&self.pending, "prefetch_pending").clone()
  }

  pub fn clear(&self) {
    mutex_lock(&self.pending, "prefetch_clear").clear();
  }

  /// Load the persisted set, applying the retrieve processor.
  pub async fn restore(&self, prefer_objects: bool) -> PrefetchSet {
    let loaded = self.persistence.load_prefetch(prefer_objects).await;
    match &self.retrieve_processor {
      Some(process) => loaded
        .into_iter()
        .map(|(key, request)| (key, process(request)))
        .collect(),
      None => loaded,
    }
  }

  /// Drop requests whose replay has been scheduled and persist what is left.
  /// A request recorded after the scheduled one is kept.
  pub fn consume(self: &Arc<Self>, scheduled: &PrefetchSet, prefer_objects: bool) {
    if scheduled.is_empty() {
      return;
    }

    {
      let mut pending = mutex_lock(&self.pending, "prefetch_consume");
      for (key, request) in scheduled {
        if pending.get(key).is_some_and(|p| p.saved_at > request.saved_at) {
          continue;
        }
        pending.remove(key);
      }
    }
    debug!(requests = scheduled.len(), "Consumed prefetch requests");
    self.persist(prefer_objects);
  }

  /// Save the pending set in the background. Saves requested while one is
  /// running are coalesced into a single follow-up save.
  fn persist(self: &Arc<Self>, prefer_objects: bool) {
    self.dirty.store(true, Ordering::SeqCst);
    if self.saving.swap(true, Ordering::SeqCst) {
      return;
    }

    let queue = Arc::clone(self);
    tokio::spawn(async move {
      loop {
        queue.dirty.store(false, Ordering::SeqCst);
        let snapshot = queue.pending();
        match queue.persistence.save_prefetch(&snapshot, prefer_objects).await {
          Ok(()) => queue.events.emit(CacheEvent::global(EventKind::PrefetchSaved)),
          Err(e) => warn!(error = %e, "Failed to save prefetch queue"),
        }

        if queue.dirty.load(Ordering::SeqCst) {
          continue;
        }
        queue.saving.store(false, Ordering::SeqCst);
        // A save requested between the check above and the release
        if !(queue.dirty.load(Ordering::SeqCst) && !queue.saving.swap(true, Ordering::SeqCst)) {
          break;
        }
      }
    });
  }
}

/// A replay step. It starts its network work synchronously (so the
/// in-flight count reflects it) and returns.
pub type ReplayTask = Box<dyn FnOnce() + Send>;

/// FIFO runner for replay tasks under a concurrency budget.
pub struct Dispatcher {
  queue: Mutex<VecDeque<ReplayTask>>,
  running: AtomicBool,
  in_flight: InFlight,
  budget: usize,
  backoff: Duration,
  events: EventBus,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
  pub fn new(in_flight: InFlight, budget: usize, backoff: Duration, events: EventBus) -> Self {
    Self {
      queue: Mutex::new(VecDeque::new()),
      running: AtomicBool::new(false),
      in_flight,
      budget,
      backoff,
      events,
      worker: Mutex::new(None),
    }
  }

  pub fn submit(&self, task: ReplayTask) {
    mutex_lock(&self.queue, "dispatcher_submit").push_back(task);
  }

  pub fn queued(&self) -> usize {
    mutex_lock(&self.queue, "dispatcher_queued").len()
  }

  /// Begin a drain cycle unless one is already running. Each cycle ends
  /// with exactly one `prefetch-loaded` notification.
  pub fn start(self: &Arc<Self>) {
    if self.running.swap(true, Ordering::SeqCst) {
      return;
    }
    let dispatcher = Arc::clone(self);
    let handle = tokio::spawn(async move { dispatcher.run().await });
    *mutex_lock(&self.worker, "dispatcher_start") = Some(handle);
  }

  async fn run(&self) {
    loop {
      let next = mutex_lock(&self.queue, "dispatcher_next").pop_front();
      let Some(task) = next else {
        self.running.store(false, Ordering::SeqCst);
        // Tasks submitted after the queue looked empty but before the release
        if self.queued() > 0 && !self.running.swap(true, Ordering::SeqCst) {
          continue;
        }
        self.events.emit(CacheEvent::global(EventKind::PrefetchLoaded));
        return;
      };

      while self.in_flight.count() >= self.budget {
        tokio::time::sleep(self.backoff).await;
      }
      task();
    }
  }

  /// Drop queued tasks and stop the worker.
  pub fn stop(&self) {
    mutex_lock(&self.queue, "dispatcher_stop").clear();
    if let Some(handle) = mutex_lock(&self.worker, "dispatcher_stop").take() {
      handle.abort();
    }
    self.running.store(false, Ordering::SeqCst);
  }
}
