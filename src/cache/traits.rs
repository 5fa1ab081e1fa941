//! Core types for the caching system.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::storage::StoreError;

/// Value persisted under a cache key.
///
/// Serialized as `{"data": ..., "timestamp": <epoch millis>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub data: T,
  /// When the value was fetched, in Unix epoch milliseconds.
  pub timestamp: i64,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      timestamp: fetched_at.timestamp_millis(),
    }
  }

  /// Time the entry was written.
  pub fn fetched_at(&self) -> DateTime<Utc> {
    Utc
      .timestamp_millis_opt(self.timestamp)
      .single()
      .unwrap_or(DateTime::<Utc>::MIN_UTC)
  }

  /// An entry is stale once its age reaches `ttl`.
  pub fn is_stale(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
    let age_ms = now.timestamp_millis().saturating_sub(self.timestamp);
    i128::from(age_ms) >= ttl.as_millis() as i128
  }
}

/// Outcome of reading a key from the cache.
#[derive(Debug)]
pub enum CacheLookup<T> {
  /// Entry present and younger than the ttl.
  Fresh(CacheEntry<T>),
  /// Entry present but expired.
  Stale(CacheEntry<T>),
  /// Nothing stored under the key.
  Miss,
  /// The store failed or held something unreadable.
  Unavailable(StoreError),
}

impl<T> CacheLookup<T> {
  pub fn fresh(self) -> Option<CacheEntry<T>> {
    match self {
      CacheLookup::Fresh(entry) => Some(entry),
      _ => None,
    }
  }
}

/// Indicates where query data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the producer
  Network,
  /// Data served from the cache before expiry
  Cache,
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
  }

  #[test]
  fn test_entry_fresh_before_ttl() {
    let entry = CacheEntry::new(1, at(1_000));
    assert!(!entry.is_stale(at(1_999), Duration::from_millis(1_000)));
  }

  #[test]
  fn test_entry_stale_at_exact_ttl() {
    let entry = CacheEntry::new(1, at(1_000));
    assert!(entry.is_stale(at(2_000), Duration::from_millis(1_000)));
  }

  #[test]
  fn test_zero_ttl_is_always_stale() {
    let entry = CacheEntry::new(1, at(1_000));
    assert!(entry.is_stale(at(1_000), Duration::ZERO));
  }

  #[test]
  fn test_entry_json_shape() {
    let entry = CacheEntry::new(serde_json::json!({"x": 1}), at(42));
    let json = serde_json::to_value(&entry).unwrap();
    assert_eq!(json, serde_json::json!({"data": {"x": 1}, "timestamp": 42}));
  }

  #[test]
  fn test_fetched_at_roundtrips_millis() {
    let entry = CacheEntry::new((), at(1_700_000_000_123));
    assert_eq!(entry.fetched_at(), at(1_700_000_000_123));
  }
}
