//! The network primitive the cache sits in front of.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::error::FetchError;
use super::key::key_for_url;
use super::options::FetchOptions;

pub const NOT_MODIFIED: u16 = 304;

/// An outgoing read request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
  /// URL with any request data already appended as a query string
  pub url: String,
  pub headers: BTreeMap<String, String>,
  /// Validator for a conditional request
  pub if_none_match: Option<String>,
  /// HTTP date for a conditional request
  pub if_modified_since: Option<String>,
}

impl Request {
  /// Build a request from read options, falling back to the resource URL.
  pub fn from_options(options: &FetchOptions, resource_url: Option<String>) -> Option<Self> {
    let url = options
      .url
      .clone()
      .filter(|u| !u.is_empty())
      .or(resource_url.filter(|u| !u.is_empty()))?;

    Some(Self {
      url: key_for_url(&url, options.data.as_ref()),
      headers: options.headers.clone(),
      if_none_match: None,
      if_modified_since: None,
    })
  }

  pub fn is_conditional(&self) -> bool {
    self.if_none_match.is_some() || self.if_modified_since.is_some()
  }
}

/// A completed network response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub etag: Option<String>,
  pub body: Value,
}

impl Response {
  pub fn ok(body: Value) -> Self {
    Self {
      status: 200,
      etag: None,
      body,
    }
  }

  pub fn not_modified() -> Self {
    Self {
      status: NOT_MODIFIED,
      etag: None,
      body: Value::Null,
    }
  }

  pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
    self.etag = Some(etag.into());
    self
  }

  pub fn is_not_modified(&self) -> bool {
    self.status == NOT_MODIFIED
  }
}

/// Request/response primitive that performs the actual network call.
///
/// Implementations report non-success statuses (other than 304) as
/// [`FetchError::Network`].
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: Request) -> Result<Response, FetchError>;
}

/// Count of network operations currently in flight, across the whole engine.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<AtomicUsize>);

impl InFlight {
  /// Register a request. The count drops when the guard does.
  pub fn enter(&self) -> InFlightGuard {
    self.0.fetch_add(1, Ordering::SeqCst);
    InFlightGuard(Arc::clone(&self.0))
  }

  pub fn count(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }
}

#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}
