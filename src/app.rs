use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::client::PredictionClient;
use crate::api::types::{
  BuildingData, ForecastHour, HorizonPrediction, HorizonRequest, ModelInfo, PredictionRequest,
  PredictionResult, WeatherData,
};
use crate::api::weather::WeatherClient;
use crate::api::Backends;
use crate::cache::{CacheService, CacheSource, NoopStore, SqliteStore};
use crate::commands::{Command, PredictArgs};
use crate::config::{CacheConfig, Config};
use crate::provider::{DashboardSnapshot, DataProvider};
use crate::query::CachedQuery;
use crate::render;

/// Main application state
pub struct App {
  config: Config,
  cache: CacheService,
  backends: Backends,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let cache = open_cache(&config.cache);
    Self::with_cache(config, cache)
  }

  pub fn with_cache(config: Config, cache: CacheService) -> Result<Self> {
    let api = PredictionClient::new(&config.api)?;
    let weather =
      WeatherClient::new(&config.weather, Duration::from_secs(config.api.timeout_secs))?;

    info!(
      api = %api.base_url(),
      location = weather.location(),
      simulated_weather = weather.is_simulated(),
      "backends configured"
    );

    Ok(Self {
      config,
      cache,
      backends: Backends { api, weather },
    })
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    match command {
      Command::Status => self.status().await,
      Command::Watch => self.watch().await,
      Command::Model { refresh } => {
        let (info, source) = self.model_info(refresh).await?;
        println!("{}", render::format_model_info(&info));
        println!("({})", render::source_label(source));
        Ok(())
      }
      Command::Forecast { hours, refresh } => {
        let (forecast, source) = self.forecast(hours, refresh).await?;
        println!("{} forecast, next {} hours", self.backends.weather.location(), hours);
        println!("{}", render::format_forecast(&forecast));
        println!("({})", render::source_label(source));
        Ok(())
      }
      Command::Predict(args) => match args.horizon {
        Some(horizon) => {
          let (prediction, source) = self.predict_horizon(&args, horizon).await?;
          println!("{}", render::format_horizon(&prediction));
          println!("({})", render::source_label(source));
          Ok(())
        }
        None => {
          let (result, source) = self.predict(&args).await?;
          println!("{}", render::format_prediction(&result));
          println!("({})", render::source_label(source));
          Ok(())
        }
      },
    }
  }

  /// One provider cycle, printed once.
  async fn status(&self) -> Result<()> {
    let provider = DataProvider::new(self.backends.clone());
    provider.refresh_all().await;

    let snapshot = provider.snapshot();
    if let Some(health) = snapshot.health.as_ref().filter(|h| !h.is_healthy()) {
      warn!(status = %health.status, "backend reports degraded health");
    }
    println!("{}", render::format_snapshot(&snapshot, Utc::now()));
    Ok(())
  }

  /// Print every published snapshot until ctrl-c.
  async fn watch(&self) -> Result<()> {
    let provider = DataProvider::new(self.backends.clone());
    let rx = provider.subscribe();
    let handle = provider.spawn(self.config.refresh_interval());

    follow_snapshots(rx, tokio::signal::ctrl_c(), |snapshot| {
      println!("{}\n", render::format_snapshot(snapshot, Utc::now()));
    })
    .await?;

    handle.shutdown();
    Ok(())
  }

  pub async fn model_info(&self, refresh: bool) -> Result<(ModelInfo, Option<CacheSource>)> {
    let api = self.backends.api.clone();
    let query = self.query("model-info".to_string(), move || {
      let api = api.clone();
      async move { api.model_info().await }
    });
    self.load(&query, refresh).await
  }

  pub async fn forecast(
    &self,
    hours: u32,
    refresh: bool,
  ) -> Result<(Vec<ForecastHour>, Option<CacheSource>)> {
    let weather = self.backends.weather.clone();
    let key = format!("forecast:{}:{}", weather.location(), hours);
    let query = self.query(key, move || {
      let weather = weather.clone();
      async move { weather.forecast(hours).await }
    });
    self.load(&query, refresh).await
  }

  pub async fn predict(&self, args: &PredictArgs) -> Result<(PredictionResult, Option<CacheSource>)> {
    let request = PredictionRequest {
      weather_data: args.weather(),
      building_data: Some(args.building()),
      timestamp: None,
    };
    let key = request_key("predict", &request)?;

    let api = self.backends.api.clone();
    let query = self.query(key, move || {
      let api = api.clone();
      let request = request.clone();
      async move { api.predict(&request).await }
    });
    self.load(&query, args.refresh).await
  }

  /// Hourly prediction where the first hour uses the given conditions and
  /// the rest follow the weather forecast.
  pub async fn predict_horizon(
    &self,
    args: &PredictArgs,
    horizon: u32,
  ) -> Result<(HorizonPrediction, Option<CacheSource>)> {
    #[derive(Serialize)]
    struct HorizonKey<'a> {
      location: &'a str,
      horizon: u32,
      weather: WeatherData,
      building: BuildingData,
    }

    let weather_data = args.weather();
    let building_data = args.building();
    let key = request_key(
      "horizon",
      &HorizonKey {
        location: self.backends.weather.location(),
        horizon,
        weather: weather_data.clone(),
        building: building_data.clone(),
      },
    )?;

    let backends = self.backends.clone();
    let query = self.query(key, move || {
      let backends = backends.clone();
      let weather_data = weather_data.clone();
      let building_data = building_data.clone();
      async move {
        let forecast = backends.weather.forecast(horizon - 1).await?;
        let request = HorizonRequest {
          weather_data,
          weather_forecast: forecast.into_iter().map(|h| h.conditions).collect(),
          horizon,
          building_data: Some(building_data),
        };
        backends.api.predict_horizon(&request).await
      }
    });
    self.load(&query, args.refresh).await
  }

  fn query<T, F, Fut>(&self, key: String, fetcher: F) -> CachedQuery<T>
  where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    CachedQuery::new(key, self.cache.clone(), fetcher).with_ttl(self.config.cache.ttl())
  }

  /// Mount `query` and follow its state until the background fetch settles.
  /// With `refresh` the cache is bypassed.
  async fn load<T>(&self, query: &CachedQuery<T>, refresh: bool) -> Result<(T, Option<CacheSource>)>
  where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
  {
    if refresh {
      let data = query.refetch().await?;
      return Ok((data, query.state().source));
    }

    if self.cache.is_stale(query.key(), query.ttl()) {
      debug!(key = query.key(), "no fresh cached data, fetching");
    }

    let mut rx = query.subscribe();
    if query.mount().is_some() {
      while query.is_loading() {
        rx.changed()
          .await
          .map_err(|e| eyre!("Query state closed while loading: {}", e))?;
      }
    }

    match query.data() {
      Some(data) => Ok((data, query.state().source)),
      None => Err(eyre!(
        "{}",
        query.error().unwrap_or_else(|| "Failed to fetch data".to_string())
      )),
    }
  }
}

/// Hand every settled snapshot to `emit` until `shutdown` resolves or the
/// provider goes away. Returns how many snapshots were emitted.
async fn follow_snapshots<F>(
  mut rx: watch::Receiver<DashboardSnapshot>,
  shutdown: F,
  mut emit: impl FnMut(&DashboardSnapshot),
) -> Result<usize>
where
  F: Future<Output = std::io::Result<()>>,
{
  tokio::pin!(shutdown);
  let mut shown = 0;

  loop {
    tokio::select! {
      changed = rx.changed() => {
        if changed.is_err() {
          break;
        }
        let snapshot = rx.borrow_and_update().clone();
        if !snapshot.loading {
          emit(&snapshot);
          shown += 1;
        }
      }
      signal = &mut shutdown => {
        signal.map_err(|e| eyre!("Failed to listen for ctrl-c: {}", e))?;
        break;
      }
    }
  }

  Ok(shown)
}

/// Open the persistent cache, falling back to no caching when the database
/// cannot be opened.
fn open_cache(config: &CacheConfig) -> CacheService {
  if !config.enabled {
    return CacheService::new(NoopStore);
  }

  let store = match &config.path {
    Some(path) => SqliteStore::open_at(path),
    None => SqliteStore::open(),
  };

  match store {
    Ok(store) => CacheService::new(store),
    Err(e) => {
      warn!(error = %e, "cache unavailable, continuing without it");
      CacheService::new(NoopStore)
    }
  }
}

/// Cache key for a request: prefix plus SHA-256 of its JSON form.
fn request_key<T: Serialize>(prefix: &str, request: &T) -> Result<String> {
  let json =
    serde_json::to_vec(request).map_err(|e| eyre!("Failed to serialize request: {}", e))?;

  let mut hasher = Sha256::new();
  hasher.update(&json);
  Ok(format!("{}:{}", prefix, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::Parser;

  #[derive(Parser)]
  struct Cli {
    #[command(subcommand)]
    command: Command,
  }

  fn predict_args(extra: &[&str]) -> PredictArgs {
    let mut argv = vec!["heatdash", "predict"];
    argv.extend_from_slice(extra);
    match Cli::try_parse_from(argv).unwrap().command {
      Command::Predict(args) => args,
      _ => unreachable!(),
    }
  }

  fn app_for(url: &str) -> App {
    let mut config = Config::default();
    config.api.url = url.to_string();
    config.api.retries = 1;
    let cache = CacheService::new(SqliteStore::open_in_memory().unwrap());
    App::with_cache(config, cache).unwrap()
  }

  #[test]
  fn test_request_key_is_stable() {
    let a = request_key("predict", &WeatherData::default()).unwrap();
    let b = request_key("predict", &WeatherData::default()).unwrap();
    assert_eq!(a, b);
    assert!(a.starts_with("predict:"));
    assert_eq!(a.len(), "predict:".len() + 64);
  }

  #[test]
  fn test_request_key_differs_per_input() {
    let colder = WeatherData {
      temperature: -5.0,
      ..WeatherData::default()
    };
    assert_ne!(
      request_key("predict", &WeatherData::default()).unwrap(),
      request_key("predict", &colder).unwrap()
    );
  }

  #[test]
  fn test_disabled_cache_uses_noop_store() {
    let config = CacheConfig {
      enabled: false,
      ..CacheConfig::default()
    };
    let cache = open_cache(&config);
    cache.set("k", &1u32, Utc::now()).unwrap();
    assert!(cache.get::<u32>("k").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_follow_snapshots_until_shutdown() {
    let (tx, rx) = watch::channel(DashboardSnapshot::default());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown = async move {
      let _ = stop_rx.await;
      Ok::<_, std::io::Error>(())
    };
    let task = tokio::spawn(follow_snapshots(rx, shutdown, |_| {}));

    // Settled, loading, settled again
    for loading in [false, true, false] {
      tx.send_modify(|s| s.loading = loading);
      tokio::task::yield_now().await;
    }

    stop_tx.send(()).unwrap();
    assert_eq!(task.await.unwrap().unwrap(), 2);
  }

  #[tokio::test]
  async fn test_follow_snapshots_ends_with_provider() {
    let (tx, rx) = watch::channel(DashboardSnapshot::default());
    let task = tokio::spawn(follow_snapshots(rx, std::future::pending(), |_| {}));

    tx.send_modify(|s| s.loading = false);
    tokio::task::yield_now().await;
    drop(tx);

    assert_eq!(task.await.unwrap().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_model_info_served_from_cache_second_time() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/api/model-info")
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(r#"{"model_type": "CatBoost", "total_features": 42, "performance": {"test_mae": 0.3}}"#)
      .expect(1)
      .create_async()
      .await;

    let app = app_for(&server.url());

    let (info, source) = app.model_info(false).await.unwrap();
    assert_eq!(info.model_type, "CatBoost");
    assert_eq!(source, Some(CacheSource::Network));

    let (info, source) = app.model_info(false).await.unwrap();
    assert_eq!(info.total_features, 42);
    assert_eq!(source, Some(CacheSource::Cache));

    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_predict_refresh_bypasses_cache() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("POST", "/api/predict")
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(
        r#"{"heat_demand_kw": 12.5, "predictions": [12.5], "input_features": 42, "timestamp": "2024-01-01T12:00:00"}"#,
      )
      .expect(2)
      .create_async()
      .await;

    let app = app_for(&server.url());

    let (result, _) = app.predict(&predict_args(&[])).await.unwrap();
    assert_eq!(result.heat_demand_kw, 12.5);
    let (_, source) = app.predict(&predict_args(&["--refresh"])).await.unwrap();
    assert_eq!(source, Some(CacheSource::Network));

    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_predict_failure_surfaces_backend_message() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("POST", "/api/predict")
      .with_status(400)
      .with_header("content-type", "application/json")
      .with_body(r#"{"error": "Missing weather_data"}"#)
      .create_async()
      .await;

    let app = app_for(&server.url());
    let err = app.predict(&predict_args(&[])).await.unwrap_err();
    assert_eq!(err.to_string(), "Backend returned 400: Missing weather_data");
  }
}
