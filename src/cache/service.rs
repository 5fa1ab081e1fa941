//! Cache service shared by every query in the application.
//!
//! The service owns the persistent store and the clock, answers freshness
//! questions, and makes sure only one producer call per key is in flight:
//! a second request for a key that is already being fetched joins the
//! existing future instead of calling its producer again.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, de::IgnoredAny, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::storage::{KeyValueStore, StoreError};
use super::traits::{CacheEntry, CacheLookup};

const FALLBACK_ERROR: &str = "Failed to fetch data";

/// Error produced by a failed fetch, reduced to its message so it can be
/// handed to every request that joined the same in-flight call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct FetchError(String);

impl FetchError {
  pub fn new(message: impl Into<String>) -> Self {
    let message = message.into();
    if message.trim().is_empty() {
      Self(FALLBACK_ERROR.to_string())
    } else {
      Self(message)
    }
  }

  pub fn message(&self) -> &str {
    &self.0
  }
}

impl From<color_eyre::Report> for FetchError {
  fn from(report: color_eyre::Report) -> Self {
    Self::new(report.to_string())
  }
}

/// A fetch that any number of callers can await.
pub type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

struct InFlight {
  id: u64,
  fetch: Box<dyn Any + Send + Sync>,
}

/// TTL cache over a [`KeyValueStore`].
///
/// Cheap to clone; clones share the store, the clock and the in-flight table.
#[derive(Clone)]
pub struct CacheService {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
  next_flight: Arc<AtomicU64>,
}

impl CacheService {
  /// Create a cache service over `store`, using the system clock.
  pub fn new(store: impl KeyValueStore + 'static) -> Self {
    Self {
      store: Arc::new(store),
      clock: Arc::new(SystemClock),
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      next_flight: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Replace the clock used for timestamps and staleness.
  #[cfg(test)]
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Read and decode the entry stored under `key`.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>, StoreError> {
    let Some(raw) = self.store.get(key)? else {
      return Ok(None);
    };

    serde_json::from_str(&raw)
      .map(Some)
      .map_err(|e| StoreError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
      })
  }

  /// Write `value` under `key`, stamped with `timestamp`.
  pub fn set<T: Serialize>(
    &self,
    key: &str,
    value: &T,
    timestamp: DateTime<Utc>,
  ) -> Result<(), StoreError> {
    let entry = CacheEntry::new(value, timestamp);
    let raw = serde_json::to_string(&entry).map_err(|e| StoreError::Serialize(e.to_string()))?;
    self.store.set(key, &raw)
  }

  /// Classify the entry under `key` against `ttl`.
  pub fn lookup<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> CacheLookup<T> {
    match self.get::<T>(key) {
      Ok(Some(entry)) if entry.is_stale(self.now(), ttl) => CacheLookup::Stale(entry),
      Ok(Some(entry)) => CacheLookup::Fresh(entry),
      Ok(None) => CacheLookup::Miss,
      Err(e) => CacheLookup::Unavailable(e),
    }
  }

  /// Whether `key` needs a refetch. Missing or unreadable entries count as stale.
  pub fn is_stale(&self, key: &str, ttl: Duration) -> bool {
    self.lookup::<IgnoredAny>(key, ttl).fresh().is_none()
  }

  /// Run `fetcher` for `key`, or join the call already in flight for it.
  ///
  /// A successful result is written to the store before the future
  /// resolves. Store failures are logged and dropped.
  pub fn fetch<T, F, Fut>(&self, key: &str, fetcher: F) -> SharedFetch<T>
  where
    T: Serialize + Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    let mut in_flight = self.lock_in_flight();

    if let Some(flight) = in_flight.get(key) {
      match flight.fetch.downcast_ref::<SharedFetch<T>>() {
        Some(shared) => {
          debug!(key, "joining in-flight fetch");
          return shared.clone();
        }
        None => debug!(key, "in-flight fetch has a different type, starting a new one"),
      }
    }

    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
    let this = self.clone();
    let owned_key = key.to_string();
    let pending = fetcher();

    let shared = async move {
      let result = pending.await.map_err(FetchError::from);

      if let Ok(value) = &result {
        if let Err(e) = this.set(&owned_key, value, this.now()) {
          warn!(key = %owned_key, error = %e, "failed to cache data");
        }
      }

      this.finish(&owned_key, id);
      result
    }
    .boxed()
    .shared();

    in_flight.insert(
      key.to_string(),
      InFlight {
        id,
        fetch: Box::new(shared.clone()),
      },
    );

    shared
  }

  /// Number of keys with a fetch currently in flight.
  #[cfg(test)]
  pub fn in_flight_count(&self) -> usize {
    self.lock_in_flight().len()
  }

  fn finish(&self, key: &str, id: u64) {
    let mut in_flight = self.lock_in_flight();
    if in_flight.get(key).map(|f| f.id) == Some(id) {
      in_flight.remove(key);
    }
  }

  fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
    // The table holds no invariants a panicking holder could break.
    self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
  }
}
