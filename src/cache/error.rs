//! Error types for the caching system.
//!
//! Only the storage and network failure modes the cache knows how to handle
//! are modelled here. An unresolvable cache key is not an error: key
//! derivation returns `None` and the request simply goes uncached.

use thiserror::Error;

/// Failures raised by the durable storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
  /// The backend refused the write because it is full.
  #[error("storage quota exceeded")]
  QuotaExceeded,

  /// The backend is missing, disabled, or failed to open.
  #[error("storage unavailable: {0}")]
  Unavailable(String),

  /// A snapshot or record could not be encoded.
  #[error("failed to serialize cache data: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Any other backend failure. These are not recovered locally.
  #[error("storage backend error: {0}")]
  Backend(String),
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    StorageError::Backend(e.to_string())
  }
}

/// Failures delivered through a pending result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// The underlying network request failed or returned an error status.
  #[error("network request failed: {message}")]
  Network {
    status: Option<u16>,
    message: String,
  },

  /// The request was aborted through its control handle.
  #[error("request aborted")]
  Aborted,

  /// A "not modified" response arrived but the cached entry it refers to is gone.
  #[error("cache entry for {key} disappeared before revalidation completed")]
  CacheEntryMissing { key: String },

  /// The engine dropped the request without completing it (e.g. on teardown).
  #[error("request was dropped before completion")]
  Closed,
}

impl FetchError {
  pub fn network(message: impl Into<String>) -> Self {
    FetchError::Network {
      status: None,
      message: message.into(),
    }
  }

  pub fn status(status: u16, message: impl Into<String>) -> Self {
    FetchError::Network {
      status: Some(status),
      message: message.into(),
    }
  }
}
