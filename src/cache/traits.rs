//! Core traits and types for the caching system.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::options::FetchOptions;

/// Whether a resource is a single record or a collection of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
  Single,
  Collection,
}

/// Caller-supplied key function.
pub type KeyFn = Arc<dyn Fn(&FetchOptions) -> Option<String> + Send + Sync>;

/// How the cache key of a resource is derived.
#[derive(Clone, Default)]
pub enum KeyStrategy {
  /// Use the request URL (or the resource URL) plus serialized query data.
  #[default]
  Url,
  /// Ask a function for the key; its answer is used verbatim.
  Custom(KeyFn),
}

impl KeyStrategy {
  pub fn custom<F>(f: F) -> Self
  where
    F: Fn(&FetchOptions) -> Option<String> + Send + Sync + 'static,
  {
    KeyStrategy::Custom(Arc::new(f))
  }
}

impl fmt::Debug for KeyStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Url => f.write_str("Url"),
      Self::Custom(_) => f.write_str("Custom(..)"),
    }
  }
}

/// Host entity whose reads are cached.
///
/// The cache never owns the entity's state. It only hands values to
/// [`Resource::apply`], the same way a network response would be applied.
pub trait Resource: Send + Sync {
  fn kind(&self) -> ResourceKind;

  /// The resource's own URL, used when the request options carry none.
  fn url(&self) -> Option<String>;

  fn key_strategy(&self) -> KeyStrategy {
    KeyStrategy::Url
  }

  /// Transform a raw payload before it is applied. Identity by default.
  fn parse(&self, value: Value, _options: &FetchOptions) -> Value {
    value
  }

  /// Apply a payload to the entity. `options.reset` asks collections to
  /// replace rather than merge.
  fn apply(&self, value: &Value, options: &FetchOptions);

  /// The collection this resource belongs to, if any. Writes to the
  /// resource also invalidate the collection's entry.
  fn collection(&self) -> Option<Arc<dyn Resource>> {
    None
  }
}

/// Result delivered through a pending result.
#[derive(Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was last confirmed fresh (if from cache)
  pub cached_at: Option<i64>,
  /// The resource the request was made for, when self-parameter mode is on
  pub subject: Option<Arc<dyn Resource>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      subject: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: i64, source: CacheSource) -> Self {
    Self {
      data,
      source,
      cached_at: Some(cached_at),
      subject: None,
    }
  }

  pub fn with_subject(mut self, subject: Option<Arc<dyn Resource>>) -> Self {
    self.subject = subject;
    self
  }
}

impl<T: fmt::Debug> fmt::Debug for CacheResult<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheResult")
      .field("data", &self.data)
      .field("source", &self.source)
      .field("cached_at", &self.cached_at)
      .field("subject", &self.subject.is_some())
      .finish()
  }
}

/// Indicates where delivered data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh; no network call was made
  CacheFresh,
  /// Data from cache delivered ahead of a network refresh
  Prefill,
  /// Cached data confirmed by a "not modified" response
  Revalidated,
}
