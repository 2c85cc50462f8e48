//! Cache notifications.
//!
//! These are the only signals the cache emits besides completing a pending
//! result. They are advisory: nothing in the cache depends on anyone
//! listening.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// Kinds of notification emitted by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  /// A cached value was delivered to a resource.
  CacheSync,
  /// A value (cached or fresh) was applied to a resource.
  Sync,
  /// An entry's expiry window lapsed.
  CacheExpired,
  /// An entry's prefill window lapsed.
  CachePrefillExpired,
  /// The pending prefetch set was persisted.
  PrefetchSaved,
  /// The prefetch dispatcher drained its queue.
  PrefetchLoaded,
}

impl EventKind {
  /// Wire name of the notification.
  pub fn name(&self) -> &'static str {
    match self {
      Self::CacheSync => "cache-sync",
      Self::Sync => "sync",
      Self::CacheExpired => "cache-expired",
      Self::CachePrefillExpired => "cache-prefill-expired",
      Self::PrefetchSaved => "prefetch-saved",
      Self::PrefetchLoaded => "prefetch-loaded",
    }
  }
}

/// A notification, addressed to the cache key it concerns when there is one.
#[derive(Debug, Clone)]
pub struct CacheEvent {
  pub kind: EventKind,
  pub key: Option<String>,
  pub value: Option<Value>,
}

impl CacheEvent {
  pub fn keyed(kind: EventKind, key: &str, value: Option<Value>) -> Self {
    Self {
      kind,
      key: Some(key.to_string()),
      value,
    }
  }

  pub fn global(kind: EventKind) -> Self {
    Self {
      kind,
      key: None,
      value: None,
    }
  }
}

/// Broadcast channel for cache notifications.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    Self { tx }
  }

  /// Subscribe to all future notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.tx.subscribe()
  }

  pub fn emit(&self, event: CacheEvent) {
    debug!(event = event.kind.name(), key = ?event.key, "Cache event");
    // No subscribers is fine
    let _ = self.tx.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_subscribers_receive_in_order() {
    let bus = EventBus::new();
    let mut rx = bus.subscribe();

    bus.emit(CacheEvent::keyed(EventKind::CacheSync, "/a", None));
    bus.emit(CacheEvent::global(EventKind::PrefetchLoaded));

    let first = rx.recv().await.unwrap();
    assert_eq!(first.kind, EventKind::CacheSync);
    assert_eq!(first.key.as_deref(), Some("/a"));
    assert_eq!(rx.recv().await.unwrap().kind, EventKind::PrefetchLoaded);
  }

  #[test]
  fn test_emit_without_subscribers_is_silent() {
    let bus = EventBus::new();
    bus.emit(CacheEvent::global(EventKind::PrefetchSaved));
  }

  #[test]
  fn test_event_names() {
    assert_eq!(EventKind::CachePrefillExpired.name(), "cache-prefill-expired");
    assert_eq!(EventKind::PrefetchLoaded.name(), "prefetch-loaded");
  }
}
