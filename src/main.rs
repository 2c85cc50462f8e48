use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

use fetchcache::cache::{
  CacheEntry, CacheSource, Expiry, FetchOptions, RequestData, Resource, SuccessHook,
};
use fetchcache::config::Config;
use fetchcache::http::CachedHttpClient;
use fetchcache::logging;

#[derive(Parser, Debug)]
#[command(name = "fetchcache")]
#[command(about = "Cached HTTP reads with expiry, revalidation and prefetch replay")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fetchcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Increase log verbosity (-v info, -vv debug, -vvv trace)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read a URL through the cache and print the result as JSON
  Get {
    url: String,

    /// Store the response in the cache
    #[arg(long)]
    cache: bool,

    /// Print the cached value first, then refresh from the network
    #[arg(long)]
    prefill: bool,

    /// Seconds until the entry expires, or "never"
    #[arg(long, value_parser = parse_expiry)]
    expires: Option<Expiry>,

    /// Seconds until the entry stops being used for prefill, or "never"
    #[arg(long, value_parser = parse_expiry)]
    prefill_expires: Option<Expiry>,

    /// Query parameter, repeatable
    #[arg(short, long = "data", value_parser = parse_pair)]
    data: Vec<(String, String)>,

    /// Pre-encoded query string
    #[arg(long, conflicts_with = "data")]
    raw_data: Option<String>,

    /// Send a conditional request when an entry exists
    #[arg(long)]
    if_modified: bool,

    /// Skip the cache entirely
    #[arg(long, conflicts_with_all = ["cache", "prefill"])]
    no_cache: bool,
  },

  /// Drop the cached entries for a URL and its collection
  Invalidate {
    url: String,

    /// Collection URL the resource belongs to
    #[arg(long)]
    collection: Option<String>,
  },

  /// List cached entries
  Entries,

  /// Replay persisted prefetch requests
  Warm,

  /// Remove all cached entries and prefetch requests
  Clear,
}

fn parse_expiry(s: &str) -> Result<Expiry, String> {
  match s {
    "never" => Ok(Expiry::Never),
    "default" => Ok(Expiry::Default),
    _ => s
      .parse::<u64>()
      .map(Expiry::Seconds)
      .map_err(|_| format!("expected seconds or \"never\", got {}", s)),
  }
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
  s.split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected key=value, got {}", s))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init_logging(&config.log, args.verbose)
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  let client = CachedHttpClient::new(&config)?;

  match args.command {
    Command::Get {
      url,
      cache,
      prefill,
      expires,
      prefill_expires,
      data,
      raw_data,
      if_modified,
      no_cache,
    } => {
      let mut options = FetchOptions {
        prefill,
        if_modified,
        ..FetchOptions::default()
      };
      if cache {
        options.cache = Some(true);
      }
      if no_cache {
        options.cache = Some(false);
      }
      if let Some(expires) = expires {
        options.expires = expires;
      }
      if let Some(expires) = prefill_expires {
        options.prefill_expires = expires;
      }
      if let Some(raw) = raw_data {
        options.data = Some(RequestData::Raw(raw));
      } else if !data.is_empty() {
        let params: Map<String, Value> = data
          .into_iter()
          .map(|(k, v)| (k, Value::String(v)))
          .collect();
        options.data = Some(RequestData::Params(params));
      }

      options.hooks.prefill_success = prefill_printer(prefill);

      let caching = options.wants_cache();
      let mut events = client.engine().subscribe();
      let (_, pending) = client.fetch(&url, options);
      let outcome = pending.wait().await;
      if caching {
        client.flush(&mut events).await;
      }

      let result = outcome.map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;
      println!(
        "{}",
        render(&json!({
          "source": source_name(result.source),
          "cached_at": result.cached_at.map(format_ms),
          "data": result.data,
        }))
      );
    }
    Command::Invalidate { url, collection } => {
      let removed = client.invalidate(&url, collection.as_deref())?;
      println!("Removed {} entries", removed);
    }
    Command::Entries => {
      let entries = client.entries();
      if entries.is_empty() {
        println!("No cached entries");
      }
      for entry in &entries {
        println!("{}", describe(entry));
      }
    }
    Command::Warm => {
      client.warm().await?;
      println!("Prefetch replay finished, {} entries cached", client.entries().len());
    }
    Command::Clear => {
      client.clear().await?;
      println!("Cache cleared");
    }
  }

  client.engine().teardown();
  Ok(())
}

/// Hook printing the early cache delivery of a prefill read. Plain cached
/// reads only print their outcome.
fn prefill_printer(prefill: bool) -> Option<SuccessHook> {
  if !prefill {
    return None;
  }
  let print: SuccessHook = Arc::new(|_: &dyn Resource, value: &Value, _: &FetchOptions| {
    println!("{}", render(&json!({"source": "prefill", "data": value})));
  });
  Some(print)
}

fn render(value: &Value) -> String {
  serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn source_name(source: CacheSource) -> &'static str {
  match source {
    CacheSource::Network => "network",
    CacheSource::CacheFresh => "cache",
    CacheSource::Prefill => "prefill",
    CacheSource::Revalidated => "revalidated",
  }
}

fn format_ms(ms: i64) -> String {
  DateTime::from_timestamp_millis(ms)
    .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| ms.to_string())
}

fn describe(entry: &CacheEntry) -> String {
  let expires = entry
    .expires_at
    .map(format_ms)
    .unwrap_or_else(|| "never".to_string());
  let etag = entry.etag.as_deref().unwrap_or("-");
  format!(
    "{}  synced {}  expires {}  etag {}",
    entry.key,
    format_ms(entry.last_synced_at),
    expires,
    etag
  )
}
