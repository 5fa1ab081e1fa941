//! Time-to-live cache for fetched dashboard data.
//!
//! This module provides a data-agnostic caching mechanism that:
//! - Persists `{data, timestamp}` entries under string keys in a key-value store
//! - Evaluates staleness lazily on read (`now - timestamp >= ttl`)
//! - Treats the store as best-effort: failures surface as values, never panics
//! - De-duplicates concurrent fetches of the same key

mod clock;
mod service;
mod storage;
mod traits;

#[cfg(test)]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};
pub use service::{CacheService, FetchError, SharedFetch};
pub use storage::{KeyValueStore, NoopStore, SqliteStore, StoreError};
pub use traits::{CacheEntry, CacheLookup, CacheSource};
