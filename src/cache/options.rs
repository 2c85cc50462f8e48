//! Per-request cache options.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::error::FetchError;
use super::pending::RequestControl;
use super::traits::Resource;

/// Expiry setting for one of the two freshness windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expiry {
  /// Use the configured default TTL
  #[default]
  Default,
  /// Expire after this many seconds (0 means the default TTL)
  Seconds(u64),
  /// Never expire
  Never,
}

impl Expiry {
  /// Window length in milliseconds, or `None` when the entry never expires.
  /// Windows too long to represent saturate at `i64::MAX`.
  pub fn ttl_ms(&self, default_secs: u64) -> Option<i64> {
    let secs = match self {
      Self::Never => return None,
      Self::Seconds(secs) if *secs > 0 => *secs,
      _ => default_secs,
    };
    let ms = i64::try_from(secs)
      .ok()
      .and_then(|s| s.checked_mul(1000))
      .unwrap_or(i64::MAX);
    Some(ms)
  }

  /// True when the caller gave an explicit, non-zero window.
  pub fn is_explicit(&self) -> bool {
    matches!(self, Self::Seconds(secs) if *secs > 0)
  }
}

/// Query data attached to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestData {
  /// Pre-encoded query string, used verbatim
  Raw(String),
  /// Structured parameters, encoded as a query string
  Params(Map<String, Value>),
}

pub type BeforeSendHook = Arc<dyn Fn(&RequestControl, &FetchOptions) + Send + Sync>;
pub type SuccessHook = Arc<dyn Fn(&dyn Resource, &Value, &FetchOptions) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&dyn Resource, &FetchError) + Send + Sync>;

/// Completion callbacks. These never survive serialization.
#[derive(Clone, Default)]
pub struct Hooks {
  pub before_send: Option<BeforeSendHook>,
  pub success: Option<SuccessHook>,
  pub error: Option<ErrorHook>,
  pub prefill_success: Option<SuccessHook>,
}

impl fmt::Debug for Hooks {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Hooks")
      .field("before_send", &self.before_send.is_some())
      .field("success", &self.success.is_some())
      .field("error", &self.error.is_some())
      .field("prefill_success", &self.prefill_success.is_some())
      .finish()
  }
}

/// Options recognized on every cacheable read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
  /// `Some(true)` caches, `Some(false)` bypasses the cache entirely
  pub cache: Option<bool>,
  /// Serve from cache and refresh from network
  pub prefill: bool,
  pub expires: Expiry,
  pub prefill_expires: Expiry,
  /// Deliver cache hits on a later task (the default) instead of inline
  pub deferred: bool,
  pub data: Option<RequestData>,
  pub url: Option<String>,
  pub headers: BTreeMap<String, String>,
  /// Ask for a conditional request when a cached entry exists
  pub if_modified: bool,
  /// Override for the entry's last-synced timestamp (epoch ms)
  pub last_sync: Option<i64>,
  /// Collections replace instead of merge on delivery
  pub reset: bool,
  /// Run the resource's parse transform on cached values
  pub parse: bool,
  #[serde(skip)]
  pub hooks: Hooks,
}

impl Default for FetchOptions {
  fn default() -> Self {
    Self {
      cache: None,
      prefill: false,
      expires: Expiry::Default,
      prefill_expires: Expiry::Default,
      deferred: true,
      data: None,
      url: None,
      headers: BTreeMap::new(),
      if_modified: false,
      last_sync: None,
      reset: false,
      parse: true,
      hooks: Hooks::default(),
    }
  }
}

impl FetchOptions {
  /// Options for a plain cached read.
  pub fn cached() -> Self {
    Self {
      cache: Some(true),
      ..Self::default()
    }
  }

  /// Options for a prefill read.
  pub fn prefilled() -> Self {
    Self {
      prefill: true,
      ..Self::default()
    }
  }

  pub fn with_expires(mut self, expires: Expiry) -> Self {
    self.expires = expires;
    self
  }

  pub fn with_prefill_expires(mut self, expires: Expiry) -> Self {
    self.prefill_expires = expires;
    self
  }

  pub fn with_data(mut self, data: RequestData) -> Self {
    self.data = Some(data);
    self
  }

  pub fn with_url(mut self, url: impl Into<String>) -> Self {
    self.url = Some(url.into());
    self
  }

  pub fn inline(mut self) -> Self {
    self.deferred = false;
    self
  }

  /// The caller explicitly opted out of caching.
  pub fn bypasses_cache(&self) -> bool {
    self.cache == Some(false)
  }

  /// The caller asked for this read to be cached.
  pub fn wants_cache(&self) -> bool {
    self.cache == Some(true) || self.prefill
  }
}
