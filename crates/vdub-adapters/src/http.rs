//! HTTP adapter for remote model services.
//!
//! The service exposes `POST /invoke` taking and returning JSON, and
//! `GET /health` returning `{"status": "healthy"}`. Retries are left to the
//! pipeline retry engine, so a failed request is reported once.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::adapter::ModelAdapter;
use crate::error::{AdapterError, AdapterResult};
use crate::types::{AdapterConfig, AdapterStage, HealthCheckResult};

#[derive(Debug, Clone)]
pub struct HttpAdapterConfig {
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for HttpAdapterConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl HttpAdapterConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Timeout from `MODEL_SERVICE_TIMEOUT` (seconds), default 300.
    pub fn from_env(base_url: impl Into<String>) -> Self {
        let timeout = std::env::var("MODEL_SERVICE_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);
        Self::new(base_url).with_timeout(Duration::from_secs(timeout))
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

pub struct HttpModelAdapter {
    name: String,
    version: String,
    stage: AdapterStage,
    http: Client,
    config: HttpAdapterConfig,
}

impl HttpModelAdapter {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        stage: AdapterStage,
        config: HttpAdapterConfig,
    ) -> AdapterResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(AdapterError::Network)?;

        Ok(Self {
            name: name.into(),
            version: version.into(),
            stage,
            http,
            config,
        })
    }

    /// Build from a registry entry. The entry must carry a `url`.
    pub fn from_config(config: &AdapterConfig) -> AdapterResult<Self> {
        let url = config.url.as_deref().ok_or_else(|| {
            AdapterError::invalid_config(format!("adapter {} has no url", config.key()))
        })?;
        Self::new(
            config.name.clone(),
            config.version.clone(),
            config.stage,
            HttpAdapterConfig::from_env(url),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn map_send_error(&self, err: reqwest::Error) -> AdapterError {
        if err.is_timeout() {
            AdapterError::Timeout(self.config.timeout.as_secs())
        } else if err.is_connect() {
            AdapterError::ServiceUnavailable(format!("{}: {}", self.config.base_url, err))
        } else {
            AdapterError::Network(err)
        }
    }
}

#[async_trait]
impl ModelAdapter for HttpModelAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn stage(&self) -> AdapterStage {
        self.stage
    }

    async fn invoke(&self, input: Value) -> AdapterResult<Value> {
        let url = format!("{}/invoke", self.config.base_url);
        debug!(adapter = %self.name, stage = %self.stage, url = %url, "Invoking model service");

        let response = self
            .http
            .post(&url)
            .json(&input)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            if status == StatusCode::SERVICE_UNAVAILABLE {
                return Err(AdapterError::ServiceUnavailable(message));
            }
            return Err(AdapterError::RequestFailed {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await.map_err(|e| self.map_send_error(e))?;
        serde_json::from_slice(&body)
            .map_err(|e| AdapterError::InvalidResponse(format!("{}: {}", self.name, e)))
    }

    async fn health_check(&self) -> HealthCheckResult {
        let url = format!("{}/health", self.config.base_url);
        let started = Instant::now();

        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let latency_ms = started.elapsed().as_millis() as u64;
                match response.json::<HealthResponse>().await {
                    Ok(health) if health.status == "healthy" || health.status == "ok" => {
                        HealthCheckResult::healthy(latency_ms)
                    }
                    Ok(health) => HealthCheckResult::unhealthy(format!(
                        "service reported status {}",
                        health.status
                    )),
                    Err(e) => HealthCheckResult::unhealthy(format!("invalid health response: {e}")),
                }
            }
            Ok(response) => {
                warn!(adapter = %self.name, status = %response.status(), "Model health check failed");
                HealthCheckResult::unhealthy(format!("health endpoint returned {}", response.status()))
            }
            Err(e) => {
                warn!(adapter = %self.name, error = %e, "Model health check error");
                HealthCheckResult::unhealthy(e.to_string())
            }
        }
    }
}
