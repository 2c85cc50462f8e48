//! Test doubles shared by the cache tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::error::{FetchError, StorageError};
use super::object_store::ObjectStore;
use super::options::FetchOptions;
use super::storage::{KeyValueStore, MemoryStorage};
use super::traits::{KeyStrategy, Resource, ResourceKind};
use super::transport::{Request, Response, Transport};

/// A resource that records every value applied to it.
pub struct TestResource {
  kind: ResourceKind,
  url: Option<String>,
  strategy: KeyStrategy,
  collection: Option<Arc<dyn Resource>>,
  /// Field to unwrap in `parse`
  envelope: Option<String>,
  applied: Mutex<Vec<Value>>,
}

impl TestResource {
  fn new(kind: ResourceKind, url: Option<&str>) -> Self {
    Self {
      kind,
      url: url.map(String::from),
      strategy: KeyStrategy::Url,
      collection: None,
      envelope: None,
      applied: Mutex::new(Vec::new()),
    }
  }

  pub fn single(url: &str) -> Self {
    Self::new(ResourceKind::Single, Some(url))
  }

  pub fn collection(url: &str) -> Self {
    Self::new(ResourceKind::Collection, Some(url))
  }

  /// A resource without a URL.
  pub fn unnamed() -> Self {
    Self::new(ResourceKind::Single, None)
  }

  pub fn with_strategy(mut self, strategy: KeyStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  pub fn with_collection(mut self, collection: Arc<dyn Resource>) -> Self {
    self.collection = Some(collection);
    self
  }

  /// Parse payloads by taking `field` out of them.
  pub fn wrapping_parse(mut self, field: &str) -> Self {
    self.envelope = Some(field.to_string());
    self
  }

  pub fn applied(&self) -> Vec<Value> {
    self.applied.lock().unwrap().clone()
  }
}

impl Resource for TestResource {
  fn kind(&self) -> ResourceKind {
    self.kind
  }

  fn url(&self) -> Option<String> {
    self.url.clone()
  }

  fn key_strategy(&self) -> KeyStrategy {
    self.strategy.clone()
  }

  fn parse(&self, value: Value, _options: &FetchOptions) -> Value {
    match &self.envelope {
      Some(field) => value.get(field).cloned().unwrap_or(Value::Null),
      None => value,
    }
  }

  fn apply(&self, value: &Value, _options: &FetchOptions) {
    self.applied.lock().unwrap().push(value.clone());
  }

  fn collection(&self) -> Option<Arc<dyn Resource>> {
    self.collection.clone()
  }
}

/// Scripted transport. Unscripted requests succeed with
/// `{"url": .., "call": n}`, counting calls per URL from 1.
#[derive(Default)]
pub struct MockTransport {
  scripted: Mutex<HashMap<String, VecDeque<Result<Response, FetchError>>>>,
  requests: Mutex<Vec<Request>>,
  delay: Duration,
  active: AtomicUsize,
  peak: AtomicUsize,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Hold every response for `delay`.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  /// Queue the next answer for `url`.
  pub fn respond(&self, url: &str, response: Result<Response, FetchError>) {
    self
      .scripted
      .lock()
      .unwrap()
      .entry(url.to_string())
      .or_default()
      .push_back(response);
  }

  pub fn calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url == url)
      .count()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  /// Most requests ever outstanding at once.
  pub fn peak(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, request: Request) -> Result<Response, FetchError> {
    let call = {
      let mut requests = self.requests.lock().unwrap();
      requests.push(request.clone());
      requests.iter().filter(|r| r.url == request.url).count()
    };
    let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(active, Ordering::SeqCst);

    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    self.active.fetch_sub(1, Ordering::SeqCst);

    let scripted = self
      .scripted
      .lock()
      .unwrap()
      .get_mut(&request.url)
      .and_then(VecDeque::pop_front);
    scripted.unwrap_or_else(|| Ok(Response::ok(json!({"url": request.url, "call": call}))))
  }
}

/// In-memory key-value store that counts writes.
#[derive(Default)]
pub struct CountingStorage {
  inner: MemoryStorage,
  writes: AtomicUsize,
}

impl CountingStorage {
  pub fn writes(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }
}

impl KeyValueStore for CountingStorage {
  fn get(&self, slot: &str) -> Result<Option<String>, StorageError> {
    self.inner.get(slot)
  }

  fn set(&self, slot: &str, value: &str) -> Result<(), StorageError> {
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.inner.set(slot, value)
  }

  fn remove(&self, slot: &str) -> Result<(), StorageError> {
    self.inner.remove(slot)
  }
}

/// Object store that refuses every operation.
pub struct FailingObjectStore;

#[async_trait]
impl ObjectStore for FailingObjectStore {
  async fn replace(&self, _record_key: &str, _value: String) -> Result<(), StorageError> {
    Err(StorageError::Unavailable("object store not supported".into()))
  }

  async fn scan(&self) -> Result<Vec<String>, StorageError> {
    Err(StorageError::Unavailable("object store not supported".into()))
  }

  async fn clear(&self) -> Result<(), StorageError> {
    Err(StorageError::Unavailable("object store not supported".into()))
  }
}
