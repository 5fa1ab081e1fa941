use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::provider::DEFAULT_REFRESH_INTERVAL;
use crate::query::DEFAULT_TTL;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub weather: WeatherConfig,
  pub cache: CacheConfig,
  /// Seconds between dashboard refresh cycles
  pub refresh_interval_secs: u64,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      api: ApiConfig::default(),
      weather: WeatherConfig::default(),
      cache: CacheConfig::default(),
      refresh_interval_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL of the prediction backend
  pub url: String,
  pub timeout_secs: u64,
  /// Attempts per request, including the first
  pub retries: u32,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:5000".to_string(),
      timeout_secs: 10,
      retries: 3,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
  /// WeatherAPI-compatible base URL. Simulated weather is used when unset.
  pub url: Option<String>,
  pub location: String,
  pub api_key: Option<String>,
}

impl Default for WeatherConfig {
  fn default() -> Self {
    Self {
      url: None,
      location: "London".to_string(),
      api_key: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Seconds a cached value stays fresh
  pub ttl_secs: u64,
  /// Database location (defaults to the user data directory)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      ttl_secs: DEFAULT_TTL.as_secs(),
      path: None,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter used when RUST_LOG is not set
  pub level: String,
  /// Write logs here instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./heatdash.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/heatdash/config.yaml
  ///
  /// Without a file the built-in defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("heatdash.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("heatdash").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file deserializes to null, which serde_yaml rejects for structs
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  fn validate(&self) -> Result<()> {
    if self.refresh_interval_secs == 0 {
      return Err(eyre!("refresh_interval_secs must be greater than zero"));
    }
    if self.api.retries == 0 {
      return Err(eyre!("api.retries must be at least 1"));
    }
    Ok(())
  }

  pub fn refresh_interval(&self) -> Duration {
    Duration::from_secs(self.refresh_interval_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.api.url, "http://localhost:5000");
    assert_eq!(config.refresh_interval(), Duration::from_secs(120));
    assert_eq!(config.cache.ttl(), Duration::from_secs(300));
    assert!(config.cache.enabled);
    assert!(config.weather.url.is_none());
  }

  #[test]
  fn test_partial_file_keeps_defaults() {
    let config = Config::parse(
      r#"
api:
  url: http://predict.internal:8080
cache:
  ttl_secs: 60
"#,
    )
    .unwrap();

    assert_eq!(config.api.url, "http://predict.internal:8080");
    assert_eq!(config.api.retries, 3);
    assert_eq!(config.cache.ttl(), Duration::from_secs(60));
    assert_eq!(config.weather.location, "London");
    assert_eq!(config.refresh_interval_secs, 120);
  }

  #[test]
  fn test_empty_file_is_default() {
    let config = Config::parse("  \n").unwrap();
    assert_eq!(config.refresh_interval_secs, 120);
  }

  #[test]
  fn test_missing_explicit_path_errors() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_zero_interval_is_rejected() {
    let config = Config::parse("refresh_interval_secs: 0").unwrap();
    assert!(config.validate().is_err());
  }
}
