//! Plain-text rendering of dashboard data for the terminal.

use chrono::{DateTime, Utc};
use std::fmt::Write;

use crate::api::types::{
  CurrentWeather, ForecastHour, HorizonPrediction, ModelInfo, PredictionResult, Trend,
  WeatherData,
};
use crate::cache::CacheSource;
use crate::provider::DashboardSnapshot;

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

/// Human-readable age of a timestamp, e.g. "42s ago"
pub fn format_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
  let secs = (now - then).num_seconds().max(0);
  match secs {
    0..=59 => format!("{}s ago", secs),
    60..=3599 => format!("{}m ago", secs / 60),
    _ => format!("{}h ago", secs / 3600),
  }
}

pub fn source_label(source: Option<CacheSource>) -> &'static str {
  match source {
    Some(CacheSource::Cache) => "cached",
    Some(CacheSource::Network) => "live",
    None => "-",
  }
}

fn trend_arrow(trend: Trend) -> &'static str {
  match trend {
    Trend::Increasing => "↑",
    Trend::Decreasing => "↓",
    Trend::Stable => "→",
  }
}

fn format_conditions(w: &WeatherData) -> String {
  format!(
    "{:>5.1}°C  wind {:>4.1} m/s  hum {:>3.0}%  cloud {:>3.0}%  sun {:>4.0} W/m²  {:>4.0} hPa",
    w.temperature,
    w.wind_speed,
    w.humidity,
    w.cloud_cover,
    w.solar_radiation,
    w.pressure / 100.0,
  )
}

pub fn format_current_weather(current: &CurrentWeather) -> String {
  format!(
    "{} ({})\n  {}",
    current.location,
    current.observed_at.format("%Y-%m-%d %H:%M UTC"),
    format_conditions(&current.conditions)
  )
}

pub fn format_forecast(forecast: &[ForecastHour]) -> String {
  if forecast.is_empty() {
    return "  no forecast data".to_string();
  }

  forecast
    .iter()
    .map(|hour| format!("  {}  {}", hour.time.format("%a %H:%M"), format_conditions(&hour.conditions)))
    .collect::<Vec<_>>()
    .join("\n")
}

pub fn format_model_info(info: &ModelInfo) -> String {
  let mut out = String::new();
  let _ = writeln!(out, "Model:     {}", info.model_type);
  if !info.training_date.is_empty() {
    let _ = writeln!(out, "Trained:   {}", info.training_date);
  }
  let _ = writeln!(out, "Features:  {}", info.total_features);

  let perf = &info.performance;
  let metrics: Vec<String> = [
    ("MAE", perf.test_mae),
    ("RMSE", perf.test_rmse),
    ("R²", perf.test_r2),
    ("MAPE", perf.test_mape),
  ]
  .iter()
  .filter_map(|(name, value)| value.map(|v| format!("{} {:.3}", name, v)))
  .collect();
  if !metrics.is_empty() {
    let _ = writeln!(out, "Metrics:   {}", metrics.join("  "));
  }

  if let Some(confidence) = &info.confidence {
    let _ = writeln!(
      out,
      "Confidence: {} ({:.2})",
      confidence.rating, confidence.score
    );
  }

  if !info.top_features.is_empty() {
    let _ = writeln!(out, "Top features:");
    for feature in &info.top_features {
      let _ = writeln!(
        out,
        "  {:<32} {:.4}",
        truncate(&feature.feature, 32),
        feature.importance
      );
    }
  }

  out.trim_end().to_string()
}

pub fn format_prediction(result: &PredictionResult) -> String {
  format!(
    "Heat demand: {:.2} kW ({} input features, {})",
    result.heat_demand_kw, result.input_features, result.timestamp
  )
}

pub fn format_horizon(prediction: &HorizonPrediction) -> String {
  let mut out = String::new();
  let _ = writeln!(
    out,
    "{}-hour horizon ({})",
    prediction.horizon_hours, prediction.model_version
  );
  for hour in &prediction.predictions {
    let _ = writeln!(
      out,
      "  {}  {:>7.2} kW  [{:.2} - {:.2}] {}",
      hour.timestamp.get(..19).unwrap_or(&hour.timestamp),
      hour.demand,
      hour.confidence.0,
      hour.confidence.1,
      trend_arrow(hour.trend)
    );
  }
  let s = &prediction.summary;
  let _ = write!(
    out,
    "min {:.2}  max {:.2}  avg {:.2}  total {:.2} kWh",
    s.min_demand, s.max_demand, s.avg_demand, s.total_demand
  );
  out
}

pub fn format_snapshot(snapshot: &DashboardSnapshot, now: DateTime<Utc>) -> String {
  let mut out = String::new();

  let connection = if snapshot.is_connected {
    "connected"
  } else {
    "disconnected"
  };
  let checked = snapshot
    .last_check
    .map(|t| format_age(t, now))
    .unwrap_or_else(|| "never".to_string());
  let _ = writeln!(out, "Backend:   {} (checked {})", connection, checked);

  if let Some(health) = &snapshot.health {
    let _ = writeln!(
      out,
      "Status:    {}  model {}  scaler {}",
      health.status,
      if health.model_loaded { "loaded" } else { "missing" },
      if health.scaler_loaded { "loaded" } else { "missing" },
    );
  }

  match &snapshot.model_info {
    Some(info) => {
      let mae = info
        .performance
        .test_mae
        .map(|m| format!(", MAE {:.3} kW", m))
        .unwrap_or_default();
      let _ = writeln!(
        out,
        "Model:     {} ({} features{})",
        info.model_type, info.total_features, mae
      );
    }
    None => {
      let _ = writeln!(out, "Model:     unavailable");
    }
  }

  match &snapshot.current_weather {
    Some(current) => {
      let _ = writeln!(out, "Weather:   {}", format_current_weather(current));
    }
    None => {
      let _ = writeln!(out, "Weather:   unavailable");
    }
  }

  match &snapshot.forecast {
    Some(forecast) => {
      let _ = writeln!(out, "Forecast:  {} hours", forecast.len());
      let _ = writeln!(out, "{}", format_forecast(&forecast[..forecast.len().min(6)]));
    }
    None => {
      let _ = writeln!(out, "Forecast:  unavailable");
    }
  }

  if let Some(error) = &snapshot.error {
    let _ = writeln!(out, "Error:     {}", error);
  }

  out.trim_end().to_string()
}
