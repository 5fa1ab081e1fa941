//! Domain types exchanged with the prediction and weather backends.
//!
//! These double as the cached representation, so every type round-trips
//! through serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Weather
// ============================================================================

/// Weather conditions in the units the prediction model expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherData {
  /// Air temperature in °C
  pub temperature: f64,
  /// Wind speed in m/s
  pub wind_speed: f64,
  /// Relative humidity in %
  pub humidity: f64,
  /// Global horizontal irradiance in W/m²
  pub solar_radiation: f64,
  /// Cloud cover in %
  pub cloud_cover: f64,
  /// Surface pressure in Pa
  pub pressure: f64,
  /// Precipitation in mm
  pub precipitation: f64,
}

impl Default for WeatherData {
  fn default() -> Self {
    Self {
      temperature: 15.0,
      wind_speed: 8.0,
      humidity: 65.0,
      solar_radiation: 450.0,
      cloud_cover: 55.0,
      pressure: 101_325.0,
      precipitation: 0.0,
    }
  }
}

/// Current conditions at a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentWeather {
  pub location: String,
  pub observed_at: DateTime<Utc>,
  #[serde(flatten)]
  pub conditions: WeatherData,
}

/// One hour of a forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastHour {
  pub time: DateTime<Utc>,
  #[serde(flatten)]
  pub conditions: WeatherData,
}

// ============================================================================
// Building
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildingData {
  /// Heated floor area in m²
  pub floor_area: f64,
  pub num_floors: u32,
  /// Air changes per hour
  pub infiltration_rate: f64,
  pub building_type: String,
  pub construction_type: String,
}

impl Default for BuildingData {
  fn default() -> Self {
    Self {
      floor_area: 120.0,
      num_floors: 2,
      infiltration_rate: 0.5,
      building_type: "Residential".to_string(),
      construction_type: "standard".to_string(),
    }
  }
}

// ============================================================================
// Health and model metadata
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
  pub status: String,
  #[serde(default)]
  pub timestamp: String,
  #[serde(default)]
  pub model_loaded: bool,
  #[serde(default)]
  pub scaler_loaded: bool,
  #[serde(default)]
  pub feature_service_loaded: bool,
  pub model_info: Option<ModelSummary>,
}

impl HealthStatus {
  pub fn is_healthy(&self) -> bool {
    self.status == "healthy"
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
  #[serde(rename = "type")]
  pub model_type: String,
  pub features: u32,
  pub mae: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
  pub model_type: String,
  #[serde(default)]
  pub training_date: String,
  #[serde(default)]
  pub total_features: u32,
  #[serde(default)]
  pub hyperparameters: serde_json::Map<String, serde_json::Value>,
  #[serde(default)]
  pub top_features: Vec<FeatureImportance>,
  pub performance: ModelPerformance,
  pub confidence: Option<ModelConfidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
  pub feature: String,
  pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPerformance {
  pub test_mape: Option<f64>,
  pub test_r2: Option<f64>,
  pub test_rmse: Option<f64>,
  pub test_mae: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfidence {
  pub rating: String,
  pub score: f64,
  #[serde(default)]
  pub explanation: String,
}

// ============================================================================
// Predictions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRequest {
  pub weather_data: WeatherData,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub building_data: Option<BuildingData>,
  /// ISO 8601 time to predict for; the backend uses "now" when absent
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
  pub heat_demand_kw: f64,
  #[serde(default)]
  pub predictions: Vec<f64>,
  #[serde(default)]
  pub input_features: u32,
  #[serde(default)]
  pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HorizonRequest {
  pub weather_data: WeatherData,
  pub weather_forecast: Vec<WeatherData>,
  /// Hours ahead; the backend accepts 24 or 48
  pub horizon: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub building_data: Option<BuildingData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
  Increasing,
  Decreasing,
  Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyDemand {
  pub timestamp: String,
  /// Predicted heat demand in kW
  pub demand: f64,
  /// Lower and upper bound of the confidence interval
  pub confidence: (f64, f64),
  pub trend: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandSummary {
  pub min_demand: f64,
  pub max_demand: f64,
  pub avg_demand: f64,
  pub total_demand: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonPrediction {
  pub predictions: Vec<HourlyDemand>,
  pub horizon_hours: u32,
  #[serde(default)]
  pub total_predictions: u32,
  #[serde(default)]
  pub model_version: String,
  #[serde(default)]
  pub generated_at: String,
  pub summary: DemandSummary,
}

/// Error body returned by the prediction backend on non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  pub error: String,
}
