//! Cached HTTP client that wraps HttpClient with the cache engine.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{
  Backends, CacheEngine, CacheEntry, CacheEvent, EventKind, FetchOptions, PendingResult,
  Resource, Transport,
};
use crate::config::Config;

use super::client::HttpClient;
use super::resource::UrlResource;

/// How long to wait for a background prefetch save before returning.
const SAVE_WAIT: Duration = Duration::from_secs(2);

/// HTTP client with transparent caching support.
///
/// Each read goes through the engine, so cache hits, prefill and
/// revalidation behave the same as for any other resource.
#[derive(Clone)]
pub struct CachedHttpClient {
  engine: Arc<CacheEngine>,
}

impl CachedHttpClient {
  /// Create a new cached client. Must be called within a Tokio runtime.
  pub fn new(config: &Config) -> Result<Self> {
    let transport = HttpClient::new(&config.http)?;
    let backends = Backends::from_config(&config.storage, &config.cache);
    Ok(Self::with_transport(config, Arc::new(transport), backends))
  }

  pub fn with_transport(config: &Config, transport: Arc<dyn Transport>, backends: Backends) -> Self {
    let engine = CacheEngine::create(config.cache.clone(), transport, backends);
    Self { engine }
  }

  pub fn engine(&self) -> &Arc<CacheEngine> {
    &self.engine
  }

  /// Start a read of `url`. The resource receives every delivery.
  pub fn fetch(&self, url: &str, options: FetchOptions) -> (Arc<UrlResource>, PendingResult) {
    let resource = Arc::new(UrlResource::single(url));
    let pending = self.engine.fetch(resource.clone(), options);
    (resource, pending)
  }

  /// Wait until a prefetch save that may have been started has finished.
  pub async fn flush(&self, events: &mut broadcast::Receiver<CacheEvent>) {
    if !self.engine.prefetch_enabled() {
      return;
    }
    let saved = tokio::time::timeout(SAVE_WAIT, wait_for(events, EventKind::PrefetchSaved)).await;
    if saved.is_err() {
      debug!("No prefetch save observed");
    }
  }

  /// Drop the cached entries a write to `url` would make stale.
  pub fn invalidate(&self, url: &str, collection: Option<&str>) -> Result<usize> {
    let mut resource = UrlResource::single(url);
    if let Some(collection) = collection {
      let collection: Arc<dyn Resource> = Arc::new(UrlResource::collection(collection));
      resource = resource.in_collection(collection);
    }

    self
      .engine
      .invalidate(&resource, &FetchOptions::default())
      .map_err(|e| eyre!("Failed to invalidate {}: {}", url, e))
  }

  pub fn entries(&self) -> Vec<CacheEntry> {
    self.engine.entries()
  }

  /// Replay the persisted prefetch queue and wait for the replays to finish.
  pub async fn warm(&self) -> Result<()> {
    let mut events = self.engine.subscribe();
    if self.engine.prefetch_enabled() {
      self.engine.drain_and_replay();
    } else {
      self.engine.enable_prefetch();
    }

    wait_for(&mut events, EventKind::PrefetchLoaded).await;
    while self.engine.in_flight() > 0 {
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
    self.flush(&mut events).await;
    Ok(())
  }

  /// Remove every cached entry and pending prefetch request.
  pub async fn clear(&self) -> Result<()> {
    self
      .engine
      .reset()
      .await
      .map_err(|e| eyre!("Failed to clear cache: {}", e))
  }
}

async fn wait_for(events: &mut broadcast::Receiver<CacheEvent>, kind: EventKind) {
  loop {
    match events.recv().await {
      Ok(event) if event.kind == kind => return,
      Ok(_) => {}
      Err(broadcast::error::RecvError::Lagged(skipped)) => {
        warn!(skipped, "Missed cache events");
      }
      Err(broadcast::error::RecvError::Closed) => return,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, FetchError, Request, Response};
  use async_trait::async_trait;
  use serde_json::{json, Value};

  struct EchoTransport;

  #[async_trait]
  impl Transport for EchoTransport {
    async fn send(&self, request: Request) -> Result<Response, FetchError> {
      Ok(Response::ok(json!({"url": request.url})))
    }
  }

  fn client(config: Config) -> CachedHttpClient {
    CachedHttpClient::with_transport(&config, Arc::new(EchoTransport), Backends::memory(None))
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_then_hit() {
    let client = client(Config::default());

    let (resource, pending) = client.fetch("/widgets/1", FetchOptions::cached());
    assert_eq!(pending.wait().await.unwrap().source, CacheSource::Network);
    assert_eq!(resource.value(), json!({"url": "/widgets/1"}));

    let (_, pending) = client.fetch("/widgets/1", FetchOptions::cached());
    assert_eq!(pending.wait().await.unwrap().source, CacheSource::CacheFresh);
    assert_eq!(client.entries().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_with_collection() {
    let client = client(Config::default());
    for url in ["/widgets", "/widgets/1"] {
      let (_, pending) = client.fetch(url, FetchOptions::cached());
      pending.wait().await.unwrap();
    }

    assert_eq!(client.invalidate("/widgets/1", Some("/widgets")).unwrap(), 2);
    assert_eq!(client.invalidate("/widgets/1", Some("/widgets")).unwrap(), 0);
    assert!(client.entries().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_warm_with_empty_queue() {
    let client = client(Config::default());
    client.warm().await.unwrap();
    assert!(client.engine().prefetch_enabled());
    assert_eq!(client.engine().in_flight(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear() {
    let client = client(Config::default());
    let (_, pending) = client.fetch("/widgets/1", FetchOptions::cached());
    let value: Value = pending.wait().await.unwrap().data;
    assert!(value.is_object());

    client.clear().await.unwrap();
    assert!(client.entries().is_empty());
  }
}
