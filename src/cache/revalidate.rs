//! Conditional requests for cached entries.

use chrono::DateTime;
use tracing::debug;

use super::entry::CacheEntry;
use super::error::FetchError;
use super::options::FetchOptions;
use super::transport::{Request, Response};

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Mark `request` conditional on `entry`. The etag becomes `If-None-Match`
/// and the last sync time becomes `If-Modified-Since`.
pub fn prepare(request: &mut Request, entry: &CacheEntry) {
  request.if_none_match = entry.etag.clone();
  request.if_modified_since = http_date(entry.last_synced_at);
  debug!(
    key = %entry.key,
    etag = ?entry.etag,
    "Sending conditional request"
  );
}

/// Reconcile a "not modified" response with the entry currently cached for
/// `key`. The result keeps the cached value with both windows restarted.
pub fn reconcile(
  key: &str,
  current: Option<&CacheEntry>,
  response: &Response,
  options: &FetchOptions,
  now: i64,
  default_ttl_secs: u64,
) -> Result<CacheEntry, FetchError> {
  let entry = current
    .filter(|e| e.has_value())
    .ok_or_else(|| FetchError::CacheEntryMissing {
      key: key.to_string(),
    })?;

  let mut refreshed = entry.refreshed(options, now, default_ttl_secs);
  if response.etag.is_some() {
    refreshed.etag = response.etag.clone();
  }
  Ok(refreshed)
}

fn http_date(epoch_ms: i64) -> Option<String> {
  DateTime::from_timestamp_millis(epoch_ms).map(|at| at.format(HTTP_DATE).to_string())
}
