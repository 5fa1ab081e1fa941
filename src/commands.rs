use clap::{Args, Subcommand};

use crate::api::types::{BuildingData, WeatherData};

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
  /// Fetch every dashboard value once and print it
  Status,
  /// Keep the dashboard refreshed until interrupted
  Watch,
  /// Show metadata about the deployed prediction model
  Model {
    /// Ignore cached data
    #[arg(long)]
    refresh: bool,
  },
  /// Show the hourly weather forecast
  Forecast {
    /// Number of hours to show
    #[arg(long, default_value_t = 24)]
    hours: u32,
    /// Ignore cached data
    #[arg(long)]
    refresh: bool,
  },
  /// Predict heat demand for given weather conditions
  Predict(PredictArgs),
}

#[derive(Args, Debug)]
pub struct PredictArgs {
  /// Air temperature in °C
  #[arg(long, default_value_t = 15.0, allow_negative_numbers = true)]
  pub temperature: f64,
  /// Wind speed in m/s
  #[arg(long, default_value_t = 8.0)]
  pub wind_speed: f64,
  /// Relative humidity in %
  #[arg(long, default_value_t = 65.0)]
  pub humidity: f64,
  /// Solar radiation in W/m²
  #[arg(long, default_value_t = 450.0)]
  pub solar_radiation: f64,
  /// Cloud cover in %
  #[arg(long, default_value_t = 55.0)]
  pub cloud_cover: f64,
  /// Pressure in Pa
  #[arg(long, default_value_t = 101_325.0)]
  pub pressure: f64,
  /// Precipitation in mm
  #[arg(long, default_value_t = 0.0)]
  pub precipitation: f64,
  /// Heated floor area in m²
  #[arg(long, default_value_t = 120.0)]
  pub floor_area: f64,
  /// Number of floors
  #[arg(long, default_value_t = 2)]
  pub num_floors: u32,
  /// Predict every hour over a 24 or 48 hour horizon, using the weather forecast
  #[arg(long, value_parser = parse_horizon)]
  pub horizon: Option<u32>,
  /// Ignore cached data
  #[arg(long)]
  pub refresh: bool,
}

impl PredictArgs {
  pub fn weather(&self) -> WeatherData {
    WeatherData {
      temperature: self.temperature,
      wind_speed: self.wind_speed,
      humidity: self.humidity,
      solar_radiation: self.solar_radiation,
      cloud_cover: self.cloud_cover,
      pressure: self.pressure,
      precipitation: self.precipitation,
    }
  }

  pub fn building(&self) -> BuildingData {
    BuildingData {
      floor_area: self.floor_area,
      num_floors: self.num_floors,
      ..BuildingData::default()
    }
  }
}

fn parse_horizon(s: &str) -> Result<u32, String> {
  match s.parse::<u32>() {
    Ok(h @ (24 | 48)) => Ok(h),
    Ok(h) => Err(format!("horizon must be 24 or 48, got {}", h)),
    Err(e) => Err(e.to_string()),
  }
}
