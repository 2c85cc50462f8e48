use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::{FetchError, Request, Response, Transport, NOT_MODIFIED};
use crate::config::HttpConfig;

/// HTTP client wrapper implementing the cache's transport
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
  base_url: Option<Url>,
}

impl HttpClient {
  pub fn new(config: &HttpConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let base_url = config
      .base_url
      .as_deref()
      .map(Url::parse)
      .transpose()
      .map_err(|e| eyre!("Invalid base URL: {}", e))?;

    Ok(Self { client, base_url })
  }

  /// Resolve a request URL, relative to the base URL when one is configured
  pub fn resolve(&self, url: &str) -> Result<Url, FetchError> {
    let resolved = match &self.base_url {
      Some(base) => base.join(url),
      None => Url::parse(url),
    };
    resolved.map_err(|e| FetchError::network(format!("Invalid URL {}: {}", url, e)))
  }
}

#[async_trait]
impl Transport for HttpClient {
  async fn send(&self, request: Request) -> Result<Response, FetchError> {
    let url = self.resolve(&request.url)?;

    let mut builder = self.client.get(url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(etag) = &request.if_none_match {
      builder = builder.header(IF_NONE_MATCH, etag.as_str());
    }
    if let Some(since) = &request.if_modified_since {
      builder = builder.header(IF_MODIFIED_SINCE, since.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::network(format!("Request to {} failed: {}", request.url, e)))?;

    let status = response.status();
    let etag = response
      .headers()
      .get(ETAG)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    debug!(url = %request.url, status = status.as_u16(), etag = ?etag, "HTTP response");

    if status == StatusCode::NOT_MODIFIED {
      return Ok(Response {
        status: NOT_MODIFIED,
        etag,
        body: Value::Null,
      });
    }
    if !status.is_success() {
      return Err(FetchError::status(
        status.as_u16(),
        status.canonical_reason().unwrap_or("request failed"),
      ));
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| FetchError::network(format!("Failed to read response body: {}", e)))?;

    Ok(Response {
      status: status.as_u16(),
      etag,
      body: parse_body(&bytes),
    })
  }
}

/// JSON bodies are decoded; anything else is kept as text.
fn parse_body(bytes: &[u8]) -> Value {
  if bytes.is_empty() {
    return Value::Null;
  }
  serde_json::from_slice(bytes)
    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
