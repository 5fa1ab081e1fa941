use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::ApiConfig;

use super::types::{
  ApiErrorBody, HealthStatus, HorizonPrediction, HorizonRequest, ModelInfo, PredictionRequest,
  PredictionResult,
};

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Heat-demand prediction backend client
#[derive(Clone)]
pub struct PredictionClient {
  http: reqwest::Client,
  base: Url,
  attempts: u32,
}

impl PredictionClient {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let mut base =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid API url {}: {}", config.url, e))?;

    // Keep any path prefix when joining endpoint paths
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      attempts: config.retries.max(1),
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  /// Check backend and model availability
  pub async fn health(&self) -> Result<HealthStatus> {
    self
      .with_retry("health check", || self.get("api/health"))
      .await
  }

  /// Get metadata about the deployed model
  pub async fn model_info(&self) -> Result<ModelInfo> {
    self
      .with_retry("model info", || self.get("api/model-info"))
      .await
  }

  /// Predict heat demand for a single point in time
  pub async fn predict(&self, request: &PredictionRequest) -> Result<PredictionResult> {
    self
      .with_retry("prediction", || self.post("api/predict", request))
      .await
  }

  /// Predict hourly heat demand over a 24 or 48 hour horizon
  pub async fn predict_horizon(&self, request: &HorizonRequest) -> Result<HorizonPrediction> {
    if !matches!(request.horizon, 24 | 48) {
      return Err(eyre!("Horizon must be 24 or 48 hours, got {}", request.horizon));
    }

    self
      .with_retry("horizon prediction", || {
        self.post("api/predict-horizon", request)
      })
      .await
  }

  async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    let url = self.endpoint(path)?;
    debug!(%url, "GET");

    let response = self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", path, e))?;

    decode(response).await
  }

  async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
    let url = self.endpoint(path)?;
    debug!(%url, "POST");

    let response = self
      .http
      .post(url)
      .json(body)
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", path, e))?;

    decode(response).await
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint {}: {}", path, e))
  }

  /// Run `op` up to the configured number of attempts with linear backoff.
  async fn with_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let mut attempt = 1;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(e) if attempt < self.attempts => {
          warn!(attempt, error = %e, "{} failed, retrying", what);
          tokio::time::sleep(RETRY_BACKOFF * attempt).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }
}

/// Turn a response into `T`, surfacing the backend's `{"error": ...}` message on failure.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
  let status = response.status();

  if !status.is_success() {
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
      .map(|b| b.error)
      .unwrap_or_else(|_| status.canonical_reason().unwrap_or("unknown error").to_string());
    return Err(eyre!("Backend returned {}: {}", status.as_u16(), message));
  }

  response
    .json::<T>()
    .await
    .map_err(|e| eyre!("Failed to parse backend response: {}", e))
}
