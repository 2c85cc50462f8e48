//! Process-wide clock used for expiry timestamps.

use chrono::Utc;
use tokio::time::Instant;

/// Wall-clock milliseconds anchored to a tokio `Instant`.
///
/// Timestamps are derived from the tokio clock so that expiry checks and the
/// timers scheduled with `tokio::time::sleep` agree, including when the
/// runtime clock is paused in tests.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
  origin_ms: i64,
  origin: Instant,
}

impl Clock {
  /// Anchor the clock at the current wall-clock time.
  pub fn new() -> Self {
    Self::starting_at(Utc::now().timestamp_millis())
  }

  /// Anchor the clock at an explicit epoch-millisecond value.
  pub fn starting_at(origin_ms: i64) -> Self {
    Self {
      origin_ms,
      origin: Instant::now(),
    }
  }

  /// Current time in epoch milliseconds.
  pub fn now_ms(&self) -> i64 {
    self.origin_ms + self.origin.elapsed().as_millis() as i64
  }
}

impl Default for Clock {
  fn default() -> Self {
    Self::new()
  }
}
