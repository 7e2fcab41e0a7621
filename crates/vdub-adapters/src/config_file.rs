//! Registry configuration file.
//!
//! ```json
//! {
//!   "models": { "transcribe": [{ "name": "whisper", "version": "1.0", "stage": "transcribe" }] },
//!   "defaults": { "transcribe": "whisper" },
//!   "healthCheck": { "intervalSeconds": 60, "timeoutSeconds": 5 }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AdapterError, AdapterResult};
use crate::types::{AdapterConfig, AdapterStage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSettings {
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_interval() -> u64 {
    60
}

fn default_timeout() -> u64 {
    5
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl HealthCheckSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfigFile {
    #[serde(default)]
    pub models: BTreeMap<AdapterStage, Vec<AdapterConfig>>,
    /// Default adapter name per stage
    #[serde(default)]
    pub defaults: BTreeMap<AdapterStage, String>,
    #[serde(default)]
    pub health_check: HealthCheckSettings,
}

impl RegistryConfigFile {
    /// Read and validate a config file.
    pub async fn load(path: impl AsRef<Path>) -> AdapterResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let config = Self::from_json(&raw).map_err(|e| {
            AdapterError::invalid_config(format!("{}: {}", path.display(), e))
        })?;

        info!(
            path = %path.display(),
            adapters = config.models.values().map(Vec::len).sum::<usize>(),
            "Loaded adapter registry config"
        );
        Ok(config)
    }

    pub fn from_json(raw: &str) -> AdapterResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> AdapterResult<()> {
        self.validate()?;
        let body = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, body).await?;
        Ok(())
    }

    /// Check required fields, section/stage agreement and defaults.
    pub fn validate(&self) -> AdapterResult<()> {
        for (section, configs) in &self.models {
            for config in configs {
                if config.name.trim().is_empty() || config.version.trim().is_empty() {
                    return Err(AdapterError::invalid_config(format!(
                        "adapter in {section} is missing name or version"
                    )));
                }
                if config.stage != *section {
                    return Err(AdapterError::invalid_config(format!(
                        "adapter {} has stage {} but is listed under {}",
                        config.name, config.stage, section
                    )));
                }
            }

            let mut names: Vec<&str> = configs.iter().map(|c| c.name.as_str()).collect();
            names.sort_unstable();
            if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
                return Err(AdapterError::invalid_config(format!(
                    "adapter {} is listed twice under {}",
                    dup[0], section
                )));
            }
        }

        for (stage, name) in &self.defaults {
            if !self.configs(*stage).iter().any(|c| &c.name == name) {
                return Err(AdapterError::invalid_config(format!(
                    "default adapter {name} for {stage} is not configured"
                )));
            }
        }

        if self.health_check.interval_seconds == 0 || self.health_check.timeout_seconds == 0 {
            return Err(AdapterError::invalid_config(
                "health check interval and timeout must be positive",
            ));
        }
        Ok(())
    }

    pub fn configs(&self, stage: AdapterStage) -> &[AdapterConfig] {
        self.models.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn default_for(&self, stage: AdapterStage) -> Option<&str> {
        self.defaults.get(&stage).map(String::as_str)
    }

    pub fn add_model(&mut self, config: AdapterConfig) -> AdapterResult<()> {
        let configs = self.models.entry(config.stage).or_default();
        if configs.iter().any(|c| c.name == config.name) {
            return Err(AdapterError::invalid_config(format!(
                "adapter {} already exists in {}",
                config.name, config.stage
            )));
        }
        configs.push(config);
        Ok(())
    }

    /// Remove an adapter, clearing the stage default if it pointed there.
    pub fn remove_model(&mut self, stage: AdapterStage, name: &str) -> AdapterResult<AdapterConfig> {
        let configs = self
            .models
            .get_mut(&stage)
            .ok_or_else(|| AdapterError::not_found(format!("{stage}:{name}")))?;
        let index = configs
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| AdapterError::not_found(format!("{stage}:{name}")))?;
        let removed = configs.remove(index);

        if self.default_for(stage) == Some(name) {
            self.defaults.remove(&stage);
        }
        Ok(removed)
    }
}
