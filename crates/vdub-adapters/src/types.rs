//! Adapter registry types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vdub_models::Stage;

use crate::error::AdapterError;

/// Model-backed pipeline step. Muxing has no model behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStage {
    #[serde(alias = "stt")]
    Transcribe,
    #[serde(alias = "mt")]
    Translate,
    #[serde(alias = "tts")]
    Synthesize,
    #[serde(rename = "lipsync")]
    LipSync,
    VocalIsolation,
}

impl AdapterStage {
    pub const ALL: [AdapterStage; 5] = [
        AdapterStage::Transcribe,
        AdapterStage::Translate,
        AdapterStage::Synthesize,
        AdapterStage::LipSync,
        AdapterStage::VocalIsolation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterStage::Transcribe => "transcribe",
            AdapterStage::Translate => "translate",
            AdapterStage::Synthesize => "synthesize",
            AdapterStage::LipSync => "lipsync",
            AdapterStage::VocalIsolation => "vocal_isolation",
        }
    }

    /// Adapter stage serving a pipeline stage, if it is model-backed.
    pub fn for_stage(stage: Stage) -> Option<Self> {
        match stage {
            Stage::Transcribe => Some(AdapterStage::Transcribe),
            Stage::Translate => Some(AdapterStage::Translate),
            Stage::Synthesize => Some(AdapterStage::Synthesize),
            Stage::LipSync => Some(AdapterStage::LipSync),
            Stage::Mux => None,
        }
    }
}

impl fmt::Display for AdapterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterStage {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcribe" | "stt" => Ok(AdapterStage::Transcribe),
            "translate" | "mt" => Ok(AdapterStage::Translate),
            "synthesize" | "tts" => Ok(AdapterStage::Synthesize),
            "lipsync" => Ok(AdapterStage::LipSync),
            "vocal_isolation" => Ok(AdapterStage::VocalIsolation),
            other => Err(AdapterError::invalid_config(format!("unknown stage: {other}"))),
        }
    }
}

/// Result of one active health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterCapabilities {
    /// Supported language codes; empty means any
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default, alias = "maxDuration", skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
    #[serde(default, alias = "requiresGPU")]
    pub requires_gpu: bool,
    #[serde(default)]
    pub supports_batch: bool,
}

impl AdapterCapabilities {
    pub fn supports_language(&self, language: &str) -> bool {
        self.languages.is_empty() || self.languages.iter().any(|l| l == language)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

/// Registration config for one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    pub name: String,
    pub version: String,
    pub stage: AdapterStage,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher is preferred
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub capabilities: AdapterCapabilities,
    #[serde(default)]
    pub metadata: AdapterMetadata,
    /// Base URL for remote adapters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl AdapterConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>, stage: AdapterStage) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            stage,
            enabled: true,
            priority: 0,
            capabilities: AdapterCapabilities::default(),
            metadata: AdapterMetadata::default(),
            url: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.stage, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

/// Last known health of a registered adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHealth {
    pub model_name: String,
    pub stage: AdapterStage,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelHealth {
    pub fn unknown(model_name: impl Into<String>, stage: AdapterStage) -> Self {
        Self {
            model_name: model_name.into(),
            stage,
            status: HealthStatus::Unknown,
            last_check: Utc::now(),
            latency_ms: None,
            error: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Constraints for picking an adapter.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub language: Option<String>,
    pub preferred_name: Option<String>,
    /// When `Some(false)`, GPU-only adapters are skipped
    pub gpu_available: Option<bool>,
    pub duration_secs: Option<u64>,
}

impl SelectOptions {
    pub fn language(language: impl Into<String>) -> Self {
        Self {
            language: Some(language.into()),
            ..Self::default()
        }
    }

    pub fn preferred(mut self, name: impl Into<String>) -> Self {
        self.preferred_name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSummary {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub priority: i32,
    pub health: HealthStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: AdapterStage,
    pub models: Vec<AdapterSummary>,
}
