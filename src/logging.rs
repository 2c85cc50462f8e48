//! Logging setup.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.
//! When a log directory is configured, a plain-text copy is written to
//! `fetchcache.log` there as well. `RUST_LOG` overrides the level chosen
//! from the verbosity flag.

use std::fs;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

pub const LOG_FILE: &str = "fetchcache.log";

/// Keeps the file writer alive. Dropping it flushes the log file.
pub struct LoggingGuard {
  _file_guard: Option<WorkerGuard>,
}

/// Default filter for a `-v` count.
pub fn default_directive(verbose: u8) -> &'static str {
  match verbose {
    0 => "warn",
    1 => "info",
    2 => "debug",
    _ => "trace",
  }
}

pub fn init_logging(config: &LogConfig, verbose: u8) -> Result<LoggingGuard, io::Error> {
  let env_filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_writer(io::stderr)
    .with_target(false);

  let (file_layer, file_guard) = match &config.dir {
    Some(dir) => {
      fs::create_dir_all(dir)?;
      let appender = tracing_appender::rolling::never(dir, LOG_FILE);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(stderr_layer)
    .with(file_layer)
    .init();

  Ok(LoggingGuard {
    _file_guard: file_guard,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_directive() {
    assert_eq!(default_directive(0), "warn");
    assert_eq!(default_directive(1), "info");
    assert_eq!(default_directive(2), "debug");
    assert_eq!(default_directive(7), "trace");
  }

  #[test]
  fn test_directives_parse() {
    for verbose in 0..4 {
      assert!(default_directive(verbose).parse::<EnvFilter>().is_ok());
    }
  }
}
