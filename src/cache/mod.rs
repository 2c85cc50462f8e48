//! Client-side response cache.
//!
//! This module sits in front of a network [`Transport`] and provides:
//! - Cached reads with per-entry expiry and prefill windows
//! - Etag revalidation through conditional requests
//! - Write invalidation for a resource and its collection
//! - Durable persistence with priority eviction when storage is full
//! - A prefetch queue replayed on the next start under a concurrency budget

mod clock;
mod coordinator;
mod engine;
mod entry;
mod error;
mod events;
mod key;
mod lock;
mod object_store;
mod options;
mod pending;
mod persistence;
mod prefetch;
mod revalidate;
mod storage;
mod traits;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::Clock;
pub use coordinator::WriteMethod;
pub use engine::{Backends, CacheEngine, EngineBuilder};
pub use entry::{CacheEntry, DEFAULT_TTL_SECS};
pub use error::{FetchError, StorageError};
pub use events::{CacheEvent, EventKind};
pub use key::{derive_key, encode_params, key_for_url};
pub use object_store::{MemoryObjectStore, ObjectStore, SqliteObjectStore};
pub use options::{BeforeSendHook, ErrorHook, Expiry, FetchOptions, Hooks, RequestData, SuccessHook};
pub use pending::{Outcome, PendingResult, RequestControl};
pub use persistence::{earliest_expiry_first, PriorityFn};
pub use prefetch::{PrefetchProcessor, PrefetchRequest};
pub use storage::{KeyValueStore, MemoryStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, KeyStrategy, Resource, ResourceKind};
pub use transport::{Request, Response, Transport, NOT_MODIFIED};
