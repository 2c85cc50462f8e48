use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::DEFAULT_TTL_SECS;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub log: LogConfig,
  #[serde(default)]
  pub http: HttpConfig,
}

/// Settings consumed by the cache engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Process-wide caching switch
  pub enabled: bool,
  /// Capture cached reads for replay on the next start
  pub prefetch: bool,
  /// Prefer the asynchronous object store for the prefetch queue
  pub use_object_store: bool,
  /// Attach the requesting resource to delivered results
  pub self_parameter: bool,
  /// Send conditional requests for entries that carry a validator
  pub revalidate: bool,
  pub default_ttl_secs: u64,
  /// Maximum in-flight requests before prefetch replay backs off
  pub concurrency_budget: usize,
  pub backoff_ms: u64,
  /// Delay before prefetch replay begins
  pub startup_grace_ms: u64,
  pub storage_quota_bytes: Option<usize>,
  pub entry_slot: String,
  pub prefetch_slot: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      prefetch: false,
      use_object_store: false,
      self_parameter: true,
      revalidate: false,
      default_ttl_secs: DEFAULT_TTL_SECS,
      concurrency_budget: 2,
      backoff_ms: 2000,
      startup_grace_ms: 5000,
      storage_quota_bytes: Some(5 * 1024 * 1024),
      entry_slot: "fetchCache".to_string(),
      prefetch_slot: "fetchCachePrefetch".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database path (default: $XDG_DATA_HOME/fetchcache/cache.db)
  pub path: Option<PathBuf>,
  /// Run memory-only, without durable storage
  #[serde(default)]
  pub disabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Directory for a log file in addition to stderr
  pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  /// Prefix applied to relative URLs
  pub base_url: Option<String>,
  pub timeout_secs: u64,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      timeout_secs: 30,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fetchcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fetchcache/config.yaml
  ///
  /// Without any file the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fetchcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fetchcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }
}
