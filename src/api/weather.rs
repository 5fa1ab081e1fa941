//! Weather backend: a WeatherAPI-compatible HTTP service, or a simulated
//! source when no service is configured.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::WeatherConfig;

use super::types::{CurrentWeather, ForecastHour, WeatherData};

/// Global horizontal irradiance under a clear sky, W/m²
const CLEAR_SKY_IRRADIANCE: f64 = 800.0;

#[derive(Clone)]
enum Source {
  Remote {
    http: reqwest::Client,
    base: Url,
    api_key: Option<String>,
  },
  Simulated,
}

/// Weather data client
#[derive(Clone)]
pub struct WeatherClient {
  source: Source,
  location: String,
}

impl WeatherClient {
  pub fn new(config: &WeatherConfig, timeout: Duration) -> Result<Self> {
    let Some(url) = &config.url else {
      return Ok(Self::simulated(&config.location));
    };

    let mut base = Url::parse(url).map_err(|e| eyre!("Invalid weather url {}: {}", url, e))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      source: Source::Remote {
        http,
        base,
        api_key: config.api_key.clone(),
      },
      location: config.location.clone(),
    })
  }

  /// Client that generates plausible weather locally.
  pub fn simulated(location: &str) -> Self {
    Self {
      source: Source::Simulated,
      location: location.to_string(),
    }
  }

  pub fn is_simulated(&self) -> bool {
    matches!(self.source, Source::Simulated)
  }

  pub fn location(&self) -> &str {
    &self.location
  }

  /// Current conditions at the configured location
  pub async fn current(&self) -> Result<CurrentWeather> {
    match &self.source {
      Source::Simulated => Ok(CurrentWeather {
        location: self.location.clone(),
        observed_at: Utc::now(),
        conditions: WeatherData::default(),
      }),
      Source::Remote { .. } => {
        let response: ApiCurrentResponse = self.get("current.json", &[("aqi", "no")]).await?;
        Ok(CurrentWeather {
          location: format!("{}, {}", response.location.name, response.location.country),
          observed_at: epoch(response.current.last_updated_epoch),
          conditions: response.current.into(),
        })
      }
    }
  }

  /// The next `hours` hourly forecasts, starting after the current hour
  pub async fn forecast(&self, hours: u32) -> Result<Vec<ForecastHour>> {
    if hours == 0 {
      return Ok(Vec::new());
    }

    match &self.source {
      Source::Simulated => Ok(simulated_forecast(Utc::now(), hours)),
      Source::Remote { .. } => {
        // Today plus enough days to cover the horizon
        let days = (hours.div_ceil(24) + 1).min(14).to_string();
        let response: ApiForecastResponse = self
          .get("forecast.json", &[("days", days.as_str()), ("aqi", "no")])
          .await?;

        let now = Utc::now().timestamp();
        let forecast: Vec<ForecastHour> = response
          .forecast
          .forecastday
          .into_iter()
          .flat_map(|day| day.hour)
          .filter(|hour| hour.time_epoch > now)
          .take(hours as usize)
          .map(|hour| ForecastHour {
            time: epoch(hour.time_epoch),
            conditions: hour.conditions.into(),
          })
          .collect();

        if forecast.is_empty() {
          return Err(eyre!("Weather forecast contained no upcoming hours"));
        }
        Ok(forecast)
      }
    }
  }

  async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, params: &[(&str, &str)]) -> Result<T> {
    let Source::Remote { http, base, api_key } = &self.source else {
      return Err(eyre!("Simulated weather has no remote endpoint"));
    };

    let mut url = base
      .join(path)
      .map_err(|e| eyre!("Invalid weather endpoint {}: {}", path, e))?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("q", &self.location);
      for (k, v) in params {
        query.append_pair(k, v);
      }
      if let Some(key) = api_key {
        query.append_pair("key", key);
      }
    }
    debug!(path, location = %self.location, "fetching weather");

    let response = http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Weather request failed: {}", e))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      let message = serde_json::from_str::<ApiWeatherError>(&body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| status.canonical_reason().unwrap_or("unknown error").to_string());
      return Err(eyre!("Weather service returned {}: {}", status.as_u16(), message));
    }

    response
      .json::<T>()
      .await
      .map_err(|e| eyre!("Failed to parse weather response: {}", e))
  }
}

/// Deterministic forecast used when no weather service is configured.
///
/// Hour `h` (1-based) warms by 2 °C and clears by 1 % cloud per hour.
fn simulated_forecast(now: DateTime<Utc>, hours: u32) -> Vec<ForecastHour> {
  let start = now
    .duration_trunc(ChronoDuration::hours(1))
    .unwrap_or(now);

  (1..=hours)
    .map(|hour| {
      let h = f64::from(hour);
      ForecastHour {
        time: start + ChronoDuration::hours(i64::from(hour)),
        conditions: WeatherData {
          temperature: 5.0 + h * 2.0,
          wind_speed: 3.0 + h * 0.5,
          humidity: 80.0 - h * 2.0,
          solar_radiation: 100.0 + h * 50.0,
          cloud_cover: (8.0 - h).max(0.0),
          pressure: 101_325.0,
          precipitation: 0.0,
        },
      }
    })
    .collect()
}

/// Estimate irradiance from cloud cover (Kasten-Czeplak), zero at night.
fn estimate_solar_radiation(cloud_cover: f64, is_day: bool) -> f64 {
  if !is_day {
    return 0.0;
  }
  let cloud_fraction = (cloud_cover / 100.0).clamp(0.0, 1.0);
  CLEAR_SKY_IRRADIANCE * (1.0 - 0.75 * cloud_fraction.powf(3.4))
}

fn epoch(secs: i64) -> DateTime<Utc> {
  Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

// ============================================================================
// WeatherAPI response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiLocation {
  name: String,
  #[serde(default)]
  country: String,
}

#[derive(Debug, Deserialize)]
struct ApiConditions {
  temp_c: f64,
  wind_kph: f64,
  humidity: f64,
  cloud: f64,
  pressure_mb: f64,
  #[serde(default)]
  precip_mm: f64,
  #[serde(default)]
  is_day: u8,
  short_rad: Option<f64>,
}

impl From<ApiConditions> for WeatherData {
  fn from(c: ApiConditions) -> Self {
    WeatherData {
      temperature: c.temp_c,
      wind_speed: c.wind_kph / 3.6,
      humidity: c.humidity,
      solar_radiation: c
        .short_rad
        .unwrap_or_else(|| estimate_solar_radiation(c.cloud, c.is_day == 1)),
      cloud_cover: c.cloud,
      pressure: c.pressure_mb * 100.0,
      precipitation: c.precip_mm,
    }
  }
}

#[derive(Debug, Deserialize)]
struct ApiCurrent {
  last_updated_epoch: i64,
  #[serde(flatten)]
  conditions: ApiConditions,
}

impl From<ApiCurrent> for WeatherData {
  fn from(c: ApiCurrent) -> Self {
    c.conditions.into()
  }
}

#[derive(Debug, Deserialize)]
struct ApiCurrentResponse {
  location: ApiLocation,
  current: ApiCurrent,
}

#[derive(Debug, Deserialize)]
struct ApiForecastHour {
  time_epoch: i64,
  #[serde(flatten)]
  conditions: ApiConditions,
}

#[derive(Debug, Deserialize)]
struct ApiForecastDay {
  hour: Vec<ApiForecastHour>,
}

#[derive(Debug, Deserialize)]
struct ApiForecast {
  forecastday: Vec<ApiForecastDay>,
}

#[derive(Debug, Deserialize)]
struct ApiForecastResponse {
  forecast: ApiForecast,
}

#[derive(Debug, Deserialize)]
struct ApiWeatherErrorDetail {
  message: String,
}

#[derive(Debug, Deserialize)]
struct ApiWeatherError {
  error: ApiWeatherErrorDetail,
}

#[cfg(test)]
mod tests {
  use super::*;

  // 2100-01-01T00:00:00Z, safely in the future
  const FUTURE: i64 = 4_102_444_800;

  fn remote(url: &str) -> WeatherClient {
    WeatherClient::new(
      &WeatherConfig {
        url: Some(url.to_string()),
        location: "Nottingham".to_string(),
        api_key: Some("secret".to_string()),
      },
      Duration::from_secs(5),
    )
    .unwrap()
  }

  fn hour_json(epoch: i64, temp: f64) -> String {
    format!(
      r#"{{"time_epoch": {epoch}, "temp_c": {temp}, "wind_kph": 36.0, "humidity": 70, "cloud": 0, "pressure_mb": 1013.0, "precip_mm": 0.0, "is_day": 1}}"#
    )
  }

  #[test]
  fn test_unconfigured_client_is_simulated() {
    let client = WeatherClient::new(&WeatherConfig::default(), Duration::from_secs(5)).unwrap();
    assert!(client.is_simulated());
    assert_eq!(client.location(), "London");
  }

  #[test]
  fn test_simulated_forecast_values() {
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap();
    let forecast = simulated_forecast(now, 3);

    assert_eq!(forecast.len(), 3);
    assert_eq!(forecast[0].time, Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap());
    assert_eq!(forecast[0].conditions.temperature, 7.0);
    assert_eq!(forecast[2].conditions.temperature, 11.0);
    assert_eq!(forecast[2].conditions.cloud_cover, 5.0);
    assert_eq!(forecast[1].conditions.solar_radiation, 200.0);
  }

  #[test]
  fn test_simulated_cloud_cover_never_negative() {
    let forecast = simulated_forecast(Utc::now(), 12);
    assert!(forecast.iter().all(|h| h.conditions.cloud_cover >= 0.0));
    assert_eq!(forecast[11].conditions.cloud_cover, 0.0);
  }

  #[test]
  fn test_solar_estimate() {
    assert_eq!(estimate_solar_radiation(0.0, true), CLEAR_SKY_IRRADIANCE);
    assert_eq!(estimate_solar_radiation(50.0, false), 0.0);
    let overcast = estimate_solar_radiation(100.0, true);
    assert!((overcast - 200.0).abs() < 1e-9);
  }

  #[tokio::test]
  async fn test_simulated_current_is_sample() {
    let current = WeatherClient::simulated("Leeds").current().await.unwrap();
    assert_eq!(current.location, "Leeds");
    assert_eq!(current.conditions, WeatherData::default());
  }

  #[tokio::test]
  async fn test_remote_current_converts_units() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/current.json")
      .match_query(mockito::Matcher::AllOf(vec![
        mockito::Matcher::UrlEncoded("q".into(), "Nottingham".into()),
        mockito::Matcher::UrlEncoded("key".into(), "secret".into()),
      ]))
      .with_header("content-type", "application/json")
      .with_body(
        r#"{
          "location": {"name": "Nottingham", "country": "UK"},
          "current": {"last_updated_epoch": 1704110400, "temp_c": 4.5, "wind_kph": 18.0, "humidity": 81,
                      "cloud": 100, "pressure_mb": 1002.0, "precip_mm": 0.3, "is_day": 0}
        }"#,
      )
      .create_async()
      .await;

    let current = remote(&server.url()).current().await.unwrap();
    assert_eq!(current.location, "Nottingham, UK");
    assert_eq!(current.conditions.temperature, 4.5);
    assert!((current.conditions.wind_speed - 5.0).abs() < 1e-9);
    assert_eq!(current.conditions.pressure, 100_200.0);
    assert_eq!(current.conditions.solar_radiation, 0.0);
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_remote_forecast_skips_past_hours() {
    let mut server = mockito::Server::new_async().await;
    let body = format!(
      r#"{{"forecast": {{"forecastday": [{{"hour": [{}, {}, {}]}}]}}}}"#,
      hour_json(1_000, 1.0),
      hour_json(FUTURE, 2.0),
      hour_json(FUTURE + 3600, 3.0),
    );
    server
      .mock("GET", "/forecast.json")
      .match_query(mockito::Matcher::Any)
      .with_header("content-type", "application/json")
      .with_body(body)
      .create_async()
      .await;

    let forecast = remote(&server.url()).forecast(1).await.unwrap();
    assert_eq!(forecast.len(), 1);
    assert_eq!(forecast[0].conditions.temperature, 2.0);
    assert!((forecast[0].conditions.wind_speed - 10.0).abs() < 1e-9);
  }

  #[tokio::test]
  async fn test_remote_error_message_is_surfaced() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/current.json")
      .match_query(mockito::Matcher::Any)
      .with_status(401)
      .with_body(r#"{"error": {"code": 2006, "message": "API key is invalid."}}"#)
      .create_async()
      .await;

    let err = remote(&server.url()).current().await.unwrap_err();
    assert_eq!(err.to_string(), "Weather service returned 401: API key is invalid.");
  }
}
