//! Clients for the prediction and weather backends.

pub mod client;
pub mod types;
pub mod weather;

use color_eyre::Result;

use crate::provider::DashboardSource;

use client::PredictionClient;
use types::{CurrentWeather, ForecastHour, HealthStatus, ModelInfo};
use weather::WeatherClient;

/// Hours of forecast shown on the dashboard
pub const DASHBOARD_FORECAST_HOURS: u32 = 24;

/// The two backends the dashboard reads from.
#[derive(Clone)]
pub struct Backends {
  pub api: PredictionClient,
  pub weather: WeatherClient,
}

impl DashboardSource for Backends {
  async fn health(&self) -> Result<HealthStatus> {
    self.api.health().await
  }

  async fn model_info(&self) -> Result<ModelInfo> {
    self.api.model_info().await
  }

  async fn current_weather(&self) -> Result<CurrentWeather> {
    self.weather.current().await
  }

  async fn forecast(&self) -> Result<Vec<ForecastHour>> {
    self.weather.forecast(DASHBOARD_FORECAST_HOURS).await
  }
}
