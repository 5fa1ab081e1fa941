//! Aggregate dashboard data shared by every consumer.
//!
//! The provider owns one fetch cycle for the four dashboard values (backend
//! health, model metadata, current weather, forecast). Consumers subscribe to
//! its snapshot instead of calling the backends themselves.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::types::{CurrentWeather, ForecastHour, HealthStatus, ModelInfo};
use crate::query::LoadingGuard;

/// Default time between refresh cycles.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(120);

/// Error published when a cycle gets nothing from any source.
pub const ALL_SOURCES_DOWN: &str = "all dashboard sources are unreachable";

/// Where the provider gets its four values from.
pub trait DashboardSource: Send + Sync + 'static {
  fn health(&self) -> impl Future<Output = Result<HealthStatus>> + Send;
  fn model_info(&self) -> impl Future<Output = Result<ModelInfo>> + Send;
  fn current_weather(&self) -> impl Future<Output = Result<CurrentWeather>> + Send;
  fn forecast(&self) -> impl Future<Output = Result<Vec<ForecastHour>>> + Send;
}

/// Everything the dashboard shows, as of the last completed cycle.
#[derive(Debug, Clone)]
pub struct DashboardSnapshot {
  pub health: Option<HealthStatus>,
  pub model_info: Option<ModelInfo>,
  pub current_weather: Option<CurrentWeather>,
  pub forecast: Option<Vec<ForecastHour>>,
  /// The health check succeeded in the last cycle
  pub is_connected: bool,
  pub last_check: Option<DateTime<Utc>>,
  pub loading: bool,
  pub error: Option<String>,
}

impl Default for DashboardSnapshot {
  fn default() -> Self {
    Self {
      health: None,
      model_info: None,
      current_weather: None,
      forecast: None,
      is_connected: false,
      last_check: None,
      loading: true,
      error: None,
    }
  }
}

/// Shared four-slot data provider.
pub struct DataProvider<S> {
  source: Arc<S>,
  state: Arc<watch::Sender<DashboardSnapshot>>,
  latest: Arc<AtomicU64>,
  committed: Arc<AtomicU64>,
  outstanding: Arc<AtomicUsize>,
}

impl<S> Clone for DataProvider<S> {
  fn clone(&self) -> Self {
    Self {
      source: Arc::clone(&self.source),
      state: Arc::clone(&self.state),
      latest: Arc::clone(&self.latest),
      committed: Arc::clone(&self.committed),
      outstanding: Arc::clone(&self.outstanding),
    }
  }
}

impl<S: DashboardSource> DataProvider<S> {
  pub fn new(source: S) -> Self {
    let (state, _) = watch::channel(DashboardSnapshot::default());
    Self {
      source: Arc::new(source),
      state: Arc::new(state),
      latest: Arc::new(AtomicU64::new(0)),
      committed: Arc::new(AtomicU64::new(0)),
      outstanding: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn snapshot(&self) -> DashboardSnapshot {
    self.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<DashboardSnapshot> {
    self.state.subscribe()
  }

  /// Fetch all four values concurrently and publish the result.
  ///
  /// A failing source leaves its slot empty and never aborts the others.
  /// A cycle that finishes after a newer one has published is discarded.
  pub async fn refresh_all(&self) {
    let cycle = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
    let guard = LoadingGuard::begin(
      &self.state,
      &self.outstanding,
      |s: &mut DashboardSnapshot, loading| s.loading = loading,
      |_| {},
    );
    debug!(cycle, "refreshing dashboard data");

    let (health, model_info, current_weather, forecast) = tokio::join!(
      settle("health", self.source.health()),
      settle("model info", self.source.model_info()),
      settle("current weather", self.source.current_weather()),
      settle("forecast", self.source.forecast()),
    );

    let all_failed =
      health.is_none() && model_info.is_none() && current_weather.is_none() && forecast.is_none();
    let is_connected = health.is_some();

    let committed = &self.committed;
    let mut superseded = false;
    guard.settle(|s| {
      if committed.fetch_max(cycle, Ordering::SeqCst) >= cycle {
        superseded = true;
        return;
      }
      s.health = health;
      s.model_info = model_info;
      s.current_weather = current_weather;
      s.forecast = forecast;
      s.is_connected = is_connected;
      s.last_check = Some(Utc::now());
      s.error = all_failed.then(|| ALL_SOURCES_DOWN.to_string());
    });

    if superseded {
      debug!(cycle, "discarding superseded refresh");
    } else {
      info!(cycle, is_connected, "dashboard refreshed");
    }
  }

  /// Refresh now and then every `interval` until the handle is dropped.
  pub fn spawn(&self, interval: Duration) -> ProviderHandle {
    let provider = self.clone();
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        // Detached so that teardown does not cancel a cycle in flight
        let provider = provider.clone();
        tokio::spawn(async move { provider.refresh_all().await });
      }
    });

    ProviderHandle { task }
  }
}

async fn settle<T>(slot: &str, fetch: impl Future<Output = Result<T>>) -> Option<T> {
  match fetch.await {
    Ok(value) => Some(value),
    Err(e) => {
      warn!(slot, error = %e, "dashboard fetch failed");
      None
    }
  }
}

/// Keeps the refresh timer alive. Dropping it stops further cycles.
pub struct ProviderHandle {
  task: JoinHandle<()>,
}

impl ProviderHandle {
  /// Stop the timer.
  pub fn shutdown(self) {
    drop(self);
  }
}

impl Drop for ProviderHandle {
  fn drop(&mut self) {
    self.task.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::{ModelPerformance, WeatherData};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicBool, AtomicU32};

  #[derive(Default)]
  struct FakeSource {
    health_down: AtomicBool,
    all_down: AtomicBool,
    delay: Duration,
    skip_delay: AtomicBool,
    cycles: AtomicU32,
  }

  impl FakeSource {
    fn check(&self) -> Result<()> {
      if self.all_down.load(Ordering::SeqCst) {
        return Err(eyre!("connection refused"));
      }
      Ok(())
    }
  }

  impl DashboardSource for FakeSource {
    async fn health(&self) -> Result<HealthStatus> {
      self.cycles.fetch_add(1, Ordering::SeqCst);
      if !self.skip_delay.load(Ordering::SeqCst) {
        tokio::time::sleep(self.delay).await;
      }
      self.check()?;
      if self.health_down.load(Ordering::SeqCst) {
        return Err(eyre!("network down"));
      }
      Ok(HealthStatus {
        status: "healthy".to_string(),
        timestamp: String::new(),
        model_loaded: true,
        scaler_loaded: true,
        feature_service_loaded: true,
        model_info: None,
      })
    }

    async fn model_info(&self) -> Result<ModelInfo> {
      self.check()?;
      Ok(ModelInfo {
        model_type: "CatBoost".to_string(),
        training_date: String::new(),
        total_features: 42,
        hyperparameters: Default::default(),
        top_features: vec![],
        performance: ModelPerformance {
          test_mape: None,
          test_r2: None,
          test_rmse: None,
          test_mae: Some(0.3),
        },
        confidence: None,
      })
    }

    async fn current_weather(&self) -> Result<CurrentWeather> {
      self.check()?;
      Ok(CurrentWeather {
        location: "London".to_string(),
        observed_at: Utc::now(),
        conditions: WeatherData::default(),
      })
    }

    async fn forecast(&self) -> Result<Vec<ForecastHour>> {
      self.check()?;
      Ok(vec![ForecastHour {
        time: Utc::now(),
        conditions: WeatherData::default(),
      }])
    }
  }

  #[tokio::test]
  async fn test_initial_snapshot_is_loading() {
    let provider = DataProvider::new(FakeSource::default());
    let snapshot = provider.snapshot();
    assert!(snapshot.loading);
    assert!(!snapshot.is_connected);
    assert!(snapshot.last_check.is_none());
  }

  #[tokio::test]
  async fn test_refresh_populates_all_slots() {
    let provider = DataProvider::new(FakeSource::default());
    provider.refresh_all().await;

    let snapshot = provider.snapshot();
    assert!(snapshot.is_connected);
    assert!(snapshot.health.is_some());
    assert!(snapshot.model_info.is_some());
    assert!(snapshot.current_weather.is_some());
    assert_eq!(snapshot.forecast.map(|f| f.len()), Some(1));
    assert!(snapshot.last_check.is_some());
    assert!(!snapshot.loading);
    assert!(snapshot.error.is_none());
  }

  #[tokio::test]
  async fn test_health_failure_only_empties_its_slot() {
    let source = FakeSource::default();
    source.health_down.store(true, Ordering::SeqCst);
    let provider = DataProvider::new(source);

    provider.refresh_all().await;

    let snapshot = provider.snapshot();
    assert!(!snapshot.is_connected);
    assert!(snapshot.health.is_none());
    assert!(snapshot.model_info.is_some());
    assert!(snapshot.current_weather.is_some());
    assert!(snapshot.forecast.is_some());
    assert!(snapshot.error.is_none());
  }

  #[tokio::test]
  async fn test_total_outage_sets_error_until_recovery() {
    let provider = DataProvider::new(FakeSource::default());
    provider.source.all_down.store(true, Ordering::SeqCst);

    provider.refresh_all().await;
    let snapshot = provider.snapshot();
    assert_eq!(snapshot.error.as_deref(), Some(ALL_SOURCES_DOWN));
    assert!(snapshot.last_check.is_some());

    provider.source.all_down.store(false, Ordering::SeqCst);
    provider.refresh_all().await;
    assert!(provider.snapshot().error.is_none());
  }

  #[tokio::test]
  async fn test_subscribers_see_refresh() {
    let provider = DataProvider::new(FakeSource::default());
    let mut rx = provider.subscribe();

    provider.refresh_all().await;
    rx.changed().await.unwrap();
    assert!(rx.borrow_and_update().is_connected);
  }

  #[tokio::test(start_paused = true)]
  async fn test_spawn_refreshes_on_interval_until_dropped() {
    let provider = DataProvider::new(FakeSource::default());
    let handle = provider.spawn(Duration::from_millis(40));

    // Ticks at 0, 40 and 80ms
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.source.cycles.load(Ordering::SeqCst), 3);

    handle.shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(provider.source.cycles.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_teardown_before_tick_stops_next_cycle() {
    let provider = DataProvider::new(FakeSource::default());
    let handle = provider.spawn(Duration::from_millis(40));

    tokio::time::sleep(Duration::from_millis(39)).await;
    assert_eq!(provider.source.cycles.load(Ordering::SeqCst), 1);

    drop(handle);
    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(provider.source.cycles.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_teardown_does_not_cancel_cycle_in_flight() {
    let provider = DataProvider::new(FakeSource {
      delay: Duration::from_millis(50),
      ..Default::default()
    });
    let handle = provider.spawn(Duration::from_secs(60));

    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(handle);
    assert_eq!(provider.source.cycles.load(Ordering::SeqCst), 1);
    assert!(provider.snapshot().last_check.is_none());

    tokio::time::sleep(Duration::from_millis(41)).await;
    let snapshot = provider.snapshot();
    assert!(snapshot.last_check.is_some());
    assert!(!snapshot.loading);
    assert_eq!(provider.source.cycles.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_cycle_does_not_leave_provider_loading() {
    let provider = DataProvider::new(FakeSource {
      delay: Duration::from_millis(50),
      ..Default::default()
    });

    let running = provider.clone();
    let first = tokio::spawn(async move { running.refresh_all().await });
    tokio::task::yield_now().await;

    let timed_out = tokio::time::timeout(Duration::from_millis(1), provider.refresh_all()).await;
    assert!(timed_out.is_err());

    first.await.unwrap();
    let snapshot = provider.snapshot();
    assert!(!snapshot.loading);
    assert!(snapshot.is_connected);
    assert!(snapshot.forecast.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_older_cycle_does_not_overwrite_newer() {
    let slow = DataProvider::new(FakeSource {
      delay: Duration::from_millis(50),
      ..Default::default()
    });

    let running = slow.clone();
    let older = tokio::spawn(async move { running.refresh_all().await });
    tokio::task::yield_now().await;

    // The newer cycle sees every source down and publishes first
    slow.source.skip_delay.store(true, Ordering::SeqCst);
    slow.source.all_down.store(true, Ordering::SeqCst);
    slow.refresh_all().await;
    let snapshot = slow.snapshot();
    assert_eq!(snapshot.error.as_deref(), Some(ALL_SOURCES_DOWN));
    assert!(snapshot.loading);

    older.await.unwrap();
    let snapshot = slow.snapshot();
    assert_eq!(snapshot.error.as_deref(), Some(ALL_SOURCES_DOWN));
    assert!(!snapshot.loading);
  }
}
