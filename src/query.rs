//! Cached async query for data fetching.
//!
//! A `CachedQuery<T>` wraps a zero-argument async producer, remembers its last
//! successful result in the shared [`CacheService`] under a string key, and
//! reuses that result until the ttl elapses.
//!
//! # Example
//!
//! ```ignore
//! let api = api_client.clone();
//! let query = CachedQuery::new("model-info", cache.clone(), move || {
//!     let api = api.clone();
//!     async move { api.model_info().await }
//! })
//! .with_ttl(Duration::from_secs(600));
//!
//! // Serve from cache, or start fetching in the background
//! query.mount();
//!
//! // Later, bypass the cache
//! let info = query.refetch().await?;
//! ```

use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheLookup, CacheService, CacheSource, FetchError, SharedFetch};

/// Default time-to-live for cached query data.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Observable state of a query.
#[derive(Debug, Clone)]
pub struct FetchState<T> {
  /// Last successful value, kept across failed fetches
  pub data: Option<T>,
  /// A fetch started by this query is running
  pub loading: bool,
  /// Message of the most recent failure, cleared when a fetch starts
  pub error: Option<String>,
  /// Where `data` came from
  pub source: Option<CacheSource>,
}

impl<T> Default for FetchState<T> {
  fn default() -> Self {
    Self {
      data: None,
      loading: false,
      error: None,
      source: None,
    }
  }
}

type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<'static, color_eyre::Result<T>> + Send + Sync>;

struct Pending<T> {
  seq: u64,
  fetch: SharedFetch<T>,
  guard: LoadingGuard<FetchState<T>>,
}

/// Counts one outstanding request against a shared `loading` flag.
///
/// The flag is cleared when the last outstanding request either settles or
/// is dropped unfinished, so a cancelled caller never leaves it set.
pub(crate) struct LoadingGuard<S> {
  state: Arc<watch::Sender<S>>,
  outstanding: Arc<AtomicUsize>,
  set_loading: fn(&mut S, bool),
  armed: bool,
}

impl<S> LoadingGuard<S> {
  /// Register a request and set `loading`, applying `start` in the same update.
  pub(crate) fn begin(
    state: &Arc<watch::Sender<S>>,
    outstanding: &Arc<AtomicUsize>,
    set_loading: fn(&mut S, bool),
    start: impl FnOnce(&mut S),
  ) -> Self {
    state.send_modify(|s| {
      outstanding.fetch_add(1, Ordering::SeqCst);
      set_loading(s, true);
      start(s);
    });

    Self {
      state: Arc::clone(state),
      outstanding: Arc::clone(outstanding),
      set_loading,
      armed: true,
    }
  }

  /// Apply `commit` and release this request in one update.
  pub(crate) fn settle(mut self, commit: impl FnOnce(&mut S)) {
    self.armed = false;
    let outstanding = &self.outstanding;
    let set_loading = self.set_loading;
    self.state.send_modify(|s| {
      commit(s);
      if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
        set_loading(s, false);
      }
    });
  }
}

impl<S> Drop for LoadingGuard<S> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let outstanding = &self.outstanding;
    let set_loading = self.set_loading;
    self.state.send_modify(|s| {
      if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
        set_loading(s, false);
      }
    });
  }
}

/// Cached async query.
///
/// Clones share state: every clone observes and updates the same
/// [`FetchState`].
pub struct CachedQuery<T> {
  key: String,
  ttl: Duration,
  fetcher: FetcherFn<T>,
  cache: CacheService,
  state: Arc<watch::Sender<FetchState<T>>>,
  /// Sequence number handed to the most recent request
  latest: Arc<AtomicU64>,
  /// Sequence number of the most recent committed result
  committed: Arc<AtomicU64>,
  outstanding: Arc<AtomicUsize>,
}

impl<T> Clone for CachedQuery<T> {
  fn clone(&self) -> Self {
    Self {
      key: self.key.clone(),
      ttl: self.ttl,
      fetcher: Arc::clone(&self.fetcher),
      cache: self.cache.clone(),
      state: Arc::clone(&self.state),
      latest: Arc::clone(&self.latest),
      committed: Arc::clone(&self.committed),
      outstanding: Arc::clone(&self.outstanding),
    }
  }
}

impl<T> CachedQuery<T>
where
  T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
  /// Create a query for `key`.
  ///
  /// `key` must be unique across the application: two queries with the same
  /// key read and overwrite the same cache slot.
  pub fn new<F, Fut>(key: impl Into<String>, cache: CacheService, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    let (state, _) = watch::channel(FetchState::default());
    Self {
      key: key.into(),
      ttl: DEFAULT_TTL,
      fetcher: Arc::new(move || fetcher().boxed()),
      cache,
      state: Arc::new(state),
      latest: Arc::new(AtomicU64::new(0)),
      committed: Arc::new(AtomicU64::new(0)),
      outstanding: Arc::new(AtomicUsize::new(0)),
    }
  }

  /// Set how long cached data stays fresh.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  /// Snapshot of the current state.
  pub fn state(&self) -> FetchState<T> {
    self.state.borrow().clone()
  }

  /// Subscribe to state changes.
  pub fn subscribe(&self) -> watch::Receiver<FetchState<T>> {
    self.state.subscribe()
  }

  pub fn data(&self) -> Option<T> {
    self.state.borrow().data.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.state.borrow().loading
  }

  pub fn error(&self) -> Option<String> {
    self.state.borrow().error.clone()
  }

  /// Serve fresh cached data, or start a background fetch.
  ///
  /// Returns `None` on a cache hit. Otherwise `loading` is already set when
  /// this returns, and the handle resolves with the fetch result.
  pub fn mount(&self) -> Option<JoinHandle<Result<T, FetchError>>> {
    if self.serve_cached().is_some() {
      return None;
    }

    let pending = self.begin();
    let this = self.clone();
    Some(tokio::spawn(async move {
      let result = this.complete(pending).await;
      if let Err(e) = &result {
        debug!(key = %this.key, error = %e, "initial fetch failed");
      }
      result
    }))
  }

  /// Fetch data, consulting the cache first unless `force` is set.
  pub async fn fetch(&self, force: bool) -> Result<T, FetchError> {
    if !force {
      if let Some(data) = self.serve_cached() {
        return Ok(data);
      }
    }

    let pending = self.begin();
    self.complete(pending).await
  }

  /// Fetch from the producer regardless of cache freshness.
  pub async fn refetch(&self) -> Result<T, FetchError> {
    self.fetch(true).await
  }

  fn serve_cached(&self) -> Option<T> {
    match self.cache.lookup::<T>(&self.key, self.ttl) {
      CacheLookup::Fresh(entry) => {
        debug!(key = %self.key, fetched_at = %entry.fetched_at(), "cache hit");
        let data = entry.data;
        self.state.send_modify(|s| {
          s.data = Some(data.clone());
          s.source = Some(CacheSource::Cache);
        });
        Some(data)
      }
      CacheLookup::Stale(_) => {
        debug!(key = %self.key, "cache entry expired");
        None
      }
      CacheLookup::Miss => None,
      CacheLookup::Unavailable(e) => {
        warn!(key = %self.key, error = %e, "failed to read cached data");
        None
      }
    }
  }

  fn begin(&self) -> Pending<T> {
    let seq = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
    let guard = LoadingGuard::begin(
      &self.state,
      &self.outstanding,
      |s: &mut FetchState<T>, loading| s.loading = loading,
      |s| s.error = None,
    );

    let fetcher = Arc::clone(&self.fetcher);
    let fetch = self.cache.fetch(&self.key, move || fetcher());
    Pending { seq, fetch, guard }
  }

  /// Await a request and commit its result unless a newer one already has.
  async fn complete(&self, pending: Pending<T>) -> Result<T, FetchError> {
    let Pending { seq, fetch, guard } = pending;
    let result = fetch.await;

    let committed = &self.committed;
    let mut superseded = false;
    guard.settle(|s| {
      if committed.fetch_max(seq, Ordering::SeqCst) >= seq {
        superseded = true;
        return;
      }
      match &result {
        Ok(data) => {
          s.data = Some(data.clone());
          s.error = None;
          s.source = Some(CacheSource::Network);
        }
        Err(e) => s.error = Some(e.message().to_string()),
      }
    });

    if superseded {
      debug!(key = %self.key, seq, "discarding superseded result");
    }
    result
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CachedQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CachedQuery")
      .field("key", &self.key)
      .field("ttl", &self.ttl)
      .field("state", &*self.state.borrow())
      .finish_non_exhaustive()
  }
}
