//! Read and write interception.
//!
//! Every cacheable read goes through [`CacheEngine::fetch`], which decides
//! between serving the cached value, prefilling from it, revalidating it,
//! or going to the network. Writes go through [`CacheEngine::write`], which
//! only invalidates before handing over to the real write.

use futures::future::{AbortRegistration, Abortable};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::engine::CacheEngine;
use super::entry::CacheEntry;
use super::error::{FetchError, StorageError};
use super::events::{CacheEvent, EventKind};
use super::key::derive_key;
use super::lock::mutex_lock;
use super::options::FetchOptions;
use super::pending::{Completer, PendingResult};
use super::prefetch::PrefetchRequest;
use super::revalidate;
use super::traits::{CacheResult, CacheSource, Resource, ResourceKind};
use super::transport::{Request, Response};

/// Host write operations. Everything but `Read` invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
  Read,
  Create,
  Update,
  Patch,
  Delete,
}

/// What the network path does with the response.
#[derive(Debug, Clone)]
struct NetworkPlan {
  key: Option<String>,
  /// Entry to revalidate against, when the request is conditional
  revalidate: Option<CacheEntry>,
  write_through: bool,
}

impl NetworkPlan {
  fn bypass() -> Self {
    Self {
      key: None,
      revalidate: None,
      write_through: false,
    }
  }
}

/// Everything a read carries from start to completion.
struct ReadContext {
  subject: Arc<dyn Resource>,
  options: FetchOptions,
  completer: Completer,
}

impl CacheEngine {
  /// Read `subject` through the cache.
  ///
  /// The returned result may see one progress delivery (a prefill from
  /// cache) before its outcome. Deliveries made before the caller starts
  /// listening are buffered. With `options.deferred` off, a cache hit is
  /// delivered before this returns.
  pub fn fetch(self: &Arc<Self>, subject: Arc<dyn Resource>, options: FetchOptions) -> PendingResult {
    let (pending, completer, registration) = PendingResult::new();

    if let Some(hook) = &options.hooks.before_send {
      hook(&pending.control(), &options);
    }

    let read = ReadContext {
      subject,
      options,
      completer,
    };

    if !self.is_enabled() || read.options.bypasses_cache() {
      debug!("Cache bypassed");
      self.spawn_network(read, NetworkPlan::bypass(), registration);
      return pending;
    }

    let key = derive_key(read.subject.as_ref(), &read.options);
    let now = self.clock.now_ms();
    let entry = key.as_deref().and_then(|k| self.get_cache(k));

    let prefill_expired = entry.as_ref().is_some_and(|e| e.is_prefill_stale(now));
    let hit = entry
      .as_ref()
      .filter(|e| !e.is_stale(now) && e.has_value())
      .filter(|_| read.options.wants_cache());

    if let (Some(key), Some(hit)) = (key.as_deref(), hit) {
      let prefilling = read.options.prefill
        && (!read.options.prefill_expires.is_explicit() || prefill_expired);
      let source = if prefilling {
        CacheSource::Prefill
      } else {
        CacheSource::CacheFresh
      };
      debug!(%key, ?source, "Cache hit");

      let conditional = self.revalidates() || read.options.if_modified;
      let plan = NetworkPlan {
        key: Some(key.to_string()),
        revalidate: conditional.then(|| hit.clone()),
        write_through: true,
      };

      if !read.options.deferred {
        self.deliver(&read, key, hit, source);
        if prefilling {
          self.spawn_network(read, plan, registration);
        }
        return pending;
      }

      let engine = Arc::clone(self);
      let key = key.to_string();
      let hit = hit.clone();
      tokio::spawn(async move {
        tokio::task::yield_now().await;
        engine.deliver(&read, &key, &hit, source);
        if prefilling {
          engine.network(read, plan, registration).await;
        }
      });
      return pending;
    }

    debug!(key = ?key, "Cache miss");
    let revalidate = entry.filter(|_| self.revalidates() || read.options.if_modified);
    let plan = NetworkPlan {
      key,
      revalidate,
      write_through: true,
    };
    self.spawn_network(read, plan, registration);
    pending
  }

  /// Apply a cached value to the reader and complete or notify its result.
  fn deliver(&self, read: &ReadContext, key: &str, entry: &CacheEntry, source: CacheSource) {
    let subject = read.subject.as_ref();
    let options = &read.options;
    let value = if options.parse {
      subject.parse(entry.value.clone(), options)
    } else {
      entry.value.clone()
    };

    subject.apply(&value, options);
    if let Some(hook) = &options.hooks.prefill_success {
      hook(subject, &value, options);
    }
    self.events.emit(CacheEvent::keyed(
      EventKind::CacheSync,
      key,
      Some(value.clone()),
    ));
    self.events.emit(CacheEvent::keyed(EventKind::Sync, key, Some(value.clone())));

    let result = CacheResult::from_cache(entry.value.clone(), entry.last_synced_at, source)
      .with_subject(self.subject_for(&read.subject));

    if source == CacheSource::Prefill {
      read.completer.notify(result);
    } else {
      if let Some(hook) = &options.hooks.success {
        hook(subject, &value, options);
      }
      read.completer.resolve(result);
    }
  }

  fn spawn_network(self: &Arc<Self>, read: ReadContext, plan: NetworkPlan, registration: AbortRegistration) {
    tokio::spawn(self.network(read, plan, registration));
  }

  /// The network path. The request counts as in flight as soon as this is
  /// called.
  fn network(
    self: &Arc<Self>,
    read: ReadContext,
    plan: NetworkPlan,
    registration: AbortRegistration,
  ) -> impl Future<Output = ()> + Send + 'static {
    let request = Request::from_options(&read.options, read.subject.url()).map(|mut request| {
      if let Some(entry) = &plan.revalidate {
        revalidate::prepare(&mut request, entry);
      }
      request
    });
    let send = request.as_ref().map(|r| self.send_tracked(r.clone()));
    let engine = Arc::clone(self);

    async move {
      let (Some(request), Some(send)) = (request, send) else {
        engine.fail(&read, FetchError::network("request has no URL"));
        return;
      };

      match Abortable::new(send, registration).await {
        Err(_) => {
          debug!(url = %request.url, "Request aborted");
          engine.fail(&read, FetchError::Aborted);
        }
        Ok(Err(e)) => {
          warn!(url = %request.url, error = %e, "Request failed");
          engine.fail(&read, e);
        }
        Ok(Ok(response)) if response.is_not_modified() => {
          let key = plan.key.clone().unwrap_or(request.url);
          engine.not_modified(&read, &key, &response);
        }
        Ok(Ok(response)) => engine.complete(&read, plan, response),
      }
    }
  }

  /// A full response: apply it, resolve the result, then write through.
  fn complete(&self, read: &ReadContext, plan: NetworkPlan, response: Response) {
    let subject = read.subject.as_ref();
    let options = &read.options;
    let value = if options.parse {
      subject.parse(response.body.clone(), options)
    } else {
      response.body.clone()
    };

    subject.apply(&value, options);
    if let Some(hook) = &options.hooks.success {
      hook(subject, &value, options);
    }
    self.events.emit(CacheEvent {
      kind: EventKind::Sync,
      key: plan.key.clone(),
      value: Some(value),
    });
    read.completer.resolve(
      CacheResult::from_network(response.body.clone()).with_subject(self.subject_for(&read.subject)),
    );

    let Some(key) = plan.key.filter(|_| plan.write_through) else {
      return;
    };
    let stored = self.write_through(
      &key,
      subject.kind(),
      subject.url(),
      options,
      response.body,
      response.etag,
    );
    if let Err(e) = stored {
      error!(%key, error = %e, "Failed to store response");
    }
  }

  /// A "not modified" response: serve the cached value with restarted windows.
  fn not_modified(&self, read: &ReadContext, key: &str, response: &Response) {
    let now = self.clock.now_ms();
    let current = self.get_cache(key);
    let refreshed = revalidate::reconcile(
      key,
      current.as_ref(),
      response,
      &read.options,
      now,
      self.settings.default_ttl_secs,
    );

    match refreshed {
      Ok(entry) => {
        info!(%key, "Cached value revalidated");
        if let Err(e) = self.commit(entry.clone()) {
          error!(%key, error = %e, "Failed to store revalidated entry");
        }
        self.deliver(read, key, &entry, CacheSource::Revalidated);
      }
      Err(e) => {
        warn!(%key, "Not modified, but the cached entry is gone");
        self.fail(read, e);
      }
    }
  }

  fn fail(&self, read: &ReadContext, error: FetchError) {
    if let Some(hook) = &read.options.hooks.error {
      hook(read.subject.as_ref(), &error);
    }
    read.completer.reject(error);
  }

  /// Write `value` for `subject` directly, as a network response would be.
  ///
  /// Skipped (returning false) when no key resolves, when `options` bypass
  /// the cache, or when they ask for neither caching nor prefill. Must be
  /// called within a Tokio runtime.
  pub fn set_cache(
    &self,
    subject: &dyn Resource,
    options: &FetchOptions,
    value: Value,
  ) -> Result<bool, StorageError> {
    let Some(key) = derive_key(subject, options) else {
      return Ok(false);
    };
    self.write_through(&key, subject.kind(), subject.url(), options, value, None)
  }

  /// Store a response under `key` and record it for prefetch.
  pub(crate) fn write_through(
    &self,
    key: &str,
    kind: ResourceKind,
    resource_url: Option<String>,
    options: &FetchOptions,
    value: Value,
    etag: Option<String>,
  ) -> Result<bool, StorageError> {
    if options.bypasses_cache() || !options.wants_cache() {
      return Ok(false);
    }

    let now = self.clock.now_ms();
    let entry = CacheEntry::new(
      key,
      value,
      options,
      now,
      self.settings.default_ttl_secs,
      etag,
    );
    if !self.commit(entry)? {
      return Ok(false);
    }
    debug!(%key, "Cached response");

    if self.prefetch_enabled() {
      let request = PrefetchRequest::new(key, kind, options, resource_url, now);
      self.prefetch.enqueue(request, self.prefers_object_store());
    }
    Ok(true)
  }

  /// Replace the entry in memory and in durable storage.
  fn commit(&self, entry: CacheEntry) -> Result<bool, StorageError> {
    let now = self.clock.now_ms();
    let stored = mutex_lock(&self.entries, "commit").set(entry.clone(), now);
    if stored {
      self.persistence.write_entry(&entry)?;
    }
    Ok(stored)
  }

  /// Drop the entries a write to `subject` makes stale: its own, and its
  /// collection's. Returns how many were removed.
  pub fn invalidate(&self, subject: &dyn Resource, options: &FetchOptions) -> Result<usize, StorageError> {
    let mut keys = Vec::new();
    keys.extend(derive_key(subject, options));
    if let Some(collection) = subject.collection() {
      keys.extend(derive_key(collection.as_ref(), &FetchOptions::default()));
    }

    let mut removed = 0;
    for key in keys {
      if self.clear_item(&key)? {
        removed += 1;
      }
    }
    Ok(removed)
  }

  /// Run a host write, invalidating first unless it is a read or caching
  /// is disabled. The write itself is always performed unchanged.
  pub fn write<T, F>(
    &self,
    method: WriteMethod,
    subject: &dyn Resource,
    options: &FetchOptions,
    perform: F,
  ) -> Result<T, StorageError>
  where
    F: FnOnce() -> T,
  {
    if method != WriteMethod::Read && self.is_enabled() {
      let removed = self.invalidate(subject, options)?;
      debug!(?method, removed, "Invalidated before write");
    }
    Ok(perform())
  }
}
