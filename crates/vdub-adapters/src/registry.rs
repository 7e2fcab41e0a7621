//! Adapter registry.
//!
//! Adapters are keyed by (stage, name). Selection prefers healthy adapters
//! over unhealthy ones regardless of priority, so a low-priority adapter that
//! answers its probe wins over a high-priority one that does not.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adapter::ModelAdapter;
use crate::error::{AdapterError, AdapterResult};
use crate::types::{
    AdapterConfig, AdapterStage, AdapterSummary, HealthCheckResult, HealthStatus, ModelHealth,
    SelectOptions, StageSummary,
};

const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

type Key = (AdapterStage, String);

struct Registration {
    adapter: Arc<dyn ModelAdapter>,
    config: AdapterConfig,
    health: ModelHealth,
}

pub struct AdapterRegistry {
    entries: RwLock<HashMap<Key, Registration>>,
    health_timeout: Duration,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    /// Bound on a single health probe.
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    fn key(stage: AdapterStage, name: &str) -> Key {
        (stage, name.to_string())
    }

    /// Register an adapter. Its declared identity must match the config.
    pub async fn register(
        &self,
        adapter: Arc<dyn ModelAdapter>,
        config: AdapterConfig,
    ) -> AdapterResult<()> {
        if adapter.name() != config.name
            || adapter.version() != config.version
            || adapter.stage() != config.stage
        {
            return Err(AdapterError::Mismatch {
                expected: format!("{}@{} ({})", config.name, config.version, config.stage),
                actual: format!("{}@{} ({})", adapter.name(), adapter.version(), adapter.stage()),
            });
        }

        let key = Self::key(config.stage, &config.name);
        info!(
            stage = %config.stage,
            adapter = %config.name,
            version = %config.version,
            priority = config.priority,
            "Registered model adapter"
        );

        let health = ModelHealth::unknown(&config.name, config.stage);
        self.entries.write().await.insert(
            key,
            Registration {
                adapter,
                config,
                health,
            },
        );
        Ok(())
    }

    pub async fn unregister(&self, stage: AdapterStage, name: &str) -> bool {
        let removed = self.entries.write().await.remove(&Self::key(stage, name)).is_some();
        if removed {
            info!(stage = %stage, adapter = name, "Unregistered model adapter");
        }
        removed
    }

    /// Pick the best adapter for `stage`, or `None` if nothing qualifies.
    pub async fn select_adapter(
        &self,
        stage: AdapterStage,
        options: &SelectOptions,
    ) -> Option<Arc<dyn ModelAdapter>> {
        let entries = self.entries.read().await;

        if let Some(preferred) = &options.preferred_name {
            match entries.get(&Self::key(stage, preferred)) {
                Some(reg) if reg.config.enabled => return Some(reg.adapter.clone()),
                Some(_) => debug!(stage = %stage, adapter = %preferred, "Preferred adapter is disabled"),
                None => debug!(stage = %stage, adapter = %preferred, "Preferred adapter not registered"),
            }
        }

        let mut candidates: Vec<&Registration> = entries
            .values()
            .filter(|reg| reg.config.stage == stage && reg.config.enabled)
            .filter(|reg| {
                options
                    .language
                    .as_deref()
                    .map_or(true, |lang| reg.config.capabilities.supports_language(lang))
            })
            .filter(|reg| !(options.gpu_available == Some(false) && reg.config.capabilities.requires_gpu))
            .filter(|reg| match (options.duration_secs, reg.config.capabilities.max_duration_secs) {
                (Some(duration), Some(max)) => duration <= max,
                _ => true,
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.health
                .is_healthy()
                .cmp(&a.health.is_healthy())
                .then_with(|| b.config.priority.cmp(&a.config.priority))
                .then_with(|| a.config.name.cmp(&b.config.name))
        });

        candidates.first().map(|reg| reg.adapter.clone())
    }

    pub async fn adapters(&self, stage: AdapterStage) -> Vec<Arc<dyn ModelAdapter>> {
        let entries = self.entries.read().await;
        let mut regs: Vec<&Registration> =
            entries.values().filter(|r| r.config.stage == stage).collect();
        regs.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        regs.into_iter().map(|r| r.adapter.clone()).collect()
    }

    pub async fn config(&self, stage: AdapterStage, name: &str) -> Option<AdapterConfig> {
        self.entries
            .read()
            .await
            .get(&Self::key(stage, name))
            .map(|r| r.config.clone())
    }

    pub async fn configs(&self, stage: AdapterStage) -> Vec<AdapterConfig> {
        let entries = self.entries.read().await;
        let mut configs: Vec<AdapterConfig> = entries
            .values()
            .filter(|r| r.config.stage == stage)
            .map(|r| r.config.clone())
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Change a registered adapter's config. Identity fields cannot change.
    pub async fn update_config<F>(&self, stage: AdapterStage, name: &str, update: F) -> AdapterResult<AdapterConfig>
    where
        F: FnOnce(&mut AdapterConfig),
    {
        let mut entries = self.entries.write().await;
        let reg = entries
            .get_mut(&Self::key(stage, name))
            .ok_or_else(|| AdapterError::not_found(format!("{stage}:{name}")))?;

        let mut updated = reg.config.clone();
        update(&mut updated);
        if updated.name != reg.config.name
            || updated.version != reg.config.version
            || updated.stage != reg.config.stage
        {
            return Err(AdapterError::invalid_config(
                "name, version and stage cannot be changed after registration",
            ));
        }

        reg.config = updated.clone();
        info!(stage = %stage, adapter = name, "Updated adapter config");
        Ok(updated)
    }

    pub async fn set_enabled(&self, stage: AdapterStage, name: &str, enabled: bool) -> AdapterResult<()> {
        self.update_config(stage, name, |c| c.enabled = enabled).await.map(|_| ())
    }

    pub async fn health(&self, stage: AdapterStage, name: &str) -> Option<ModelHealth> {
        self.entries
            .read()
            .await
            .get(&Self::key(stage, name))
            .map(|r| r.health.clone())
    }

    pub async fn stage_health(&self, stage: AdapterStage) -> Vec<ModelHealth> {
        let entries = self.entries.read().await;
        let mut health: Vec<ModelHealth> = entries
            .values()
            .filter(|r| r.config.stage == stage)
            .map(|r| r.health.clone())
            .collect();
        health.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        health
    }

    /// Actively probe one adapter and store the result.
    ///
    /// The registry lock is not held while the probe runs.
    pub async fn check_health(&self, stage: AdapterStage, name: &str) -> AdapterResult<ModelHealth> {
        let key = Self::key(stage, name);
        let adapter = self
            .entries
            .read()
            .await
            .get(&key)
            .map(|r| r.adapter.clone())
            .ok_or_else(|| AdapterError::not_found(format!("{stage}:{name}")))?;

        let result = match tokio::time::timeout(self.health_timeout, adapter.health_check()).await {
            Ok(result) => result,
            Err(_) => HealthCheckResult::unhealthy(format!(
                "health check timed out after {}ms",
                self.health_timeout.as_millis()
            )),
        };

        let health = ModelHealth {
            model_name: name.to_string(),
            stage,
            status: if result.healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            last_check: Utc::now(),
            latency_ms: result.latency_ms,
            error: result.error,
        };

        if !health.is_healthy() {
            warn!(
                stage = %stage,
                adapter = name,
                error = health.error.as_deref().unwrap_or(""),
                "Adapter health check failed"
            );
        }

        if let Some(reg) = self.entries.write().await.get_mut(&key) {
            reg.health = health.clone();
        }
        Ok(health)
    }

    /// Probe every adapter of a stage concurrently.
    pub async fn check_stage_health(&self, stage: AdapterStage) -> Vec<ModelHealth> {
        let names: Vec<String> = self
            .adapters(stage)
            .await
            .iter()
            .map(|a| a.name().to_string())
            .collect();

        join_all(names.iter().map(|name| self.check_health(stage, name)))
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    pub async fn check_all_health(&self) -> BTreeMap<AdapterStage, Vec<ModelHealth>> {
        let results = join_all(AdapterStage::ALL.iter().map(|&stage| async move {
            (stage, self.check_stage_health(stage).await)
        }))
        .await;
        results.into_iter().collect()
    }

    pub async fn summary(&self) -> Vec<StageSummary> {
        let entries = self.entries.read().await;
        AdapterStage::ALL
            .iter()
            .map(|&stage| {
                let mut models: Vec<AdapterSummary> = entries
                    .values()
                    .filter(|r| r.config.stage == stage)
                    .map(|r| AdapterSummary {
                        name: r.config.name.clone(),
                        version: r.config.version.clone(),
                        enabled: r.config.enabled,
                        priority: r.config.priority,
                        health: r.health.status,
                    })
                    .collect();
                models.sort_by(|a, b| a.name.cmp(&b.name));
                StageSummary { stage, models }
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeAdapter {
        name: String,
        version: String,
        stage: AdapterStage,
        healthy: AtomicBool,
        hang: bool,
    }

    impl FakeAdapter {
        fn new(name: &str, stage: AdapterStage, healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                version: "1.0".into(),
                stage,
                healthy: AtomicBool::new(healthy),
                hang: false,
            })
        }

        fn hanging(name: &str, stage: AdapterStage) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                version: "1.0".into(),
                stage,
                healthy: AtomicBool::new(true),
                hang: true,
            })
        }
    }

    #[async_trait]
    impl ModelAdapter for FakeAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn version(&self) -> &str {
            &self.version
        }

        fn stage(&self) -> AdapterStage {
            self.stage
        }

        async fn invoke(&self, input: serde_json::Value) -> AdapterResult<serde_json::Value> {
            Ok(serde_json::json!({ "adapter": self.name, "input": input }))
        }

        async fn health_check(&self) -> HealthCheckResult {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.healthy.load(Ordering::SeqCst) {
                HealthCheckResult::healthy(3)
            } else {
                HealthCheckResult::unhealthy("down")
            }
        }
    }

    fn config(name: &str, stage: AdapterStage, priority: i32) -> AdapterConfig {
        AdapterConfig::new(name, "1.0", stage).with_priority(priority)
    }

    #[tokio::test]
    async fn test_register_rejects_mismatch() {
        let registry = AdapterRegistry::new();
        let adapter = FakeAdapter::new("whisper", AdapterStage::Transcribe, true);

        let wrong_version = AdapterConfig::new("whisper", "2.0", AdapterStage::Transcribe);
        let err = registry.register(adapter.clone(), wrong_version).await.unwrap_err();
        assert!(matches!(err, AdapterError::Mismatch { .. }));

        let wrong_name = AdapterConfig::new("other", "1.0", AdapterStage::Transcribe);
        assert!(registry.register(adapter.clone(), wrong_name).await.is_err());
        assert!(registry.is_empty().await);

        registry
            .register(adapter, config("whisper", AdapterStage::Transcribe, 1))
            .await
            .unwrap();
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_healthy_low_priority_beats_unhealthy_high_priority() {
        let registry = AdapterRegistry::new();
        registry
            .register(
                FakeAdapter::new("a", AdapterStage::Synthesize, false),
                config("a", AdapterStage::Synthesize, 10),
            )
            .await
            .unwrap();
        registry
            .register(
                FakeAdapter::new("b", AdapterStage::Synthesize, true),
                config("b", AdapterStage::Synthesize, 1),
            )
            .await
            .unwrap();

        // Before probing both are unknown, so priority decides
        let picked = registry
            .select_adapter(AdapterStage::Synthesize, &SelectOptions::default())
            .await
            .unwrap();
        assert_eq!(picked.name(), "a");

        registry.check_stage_health(AdapterStage::Synthesize).await;
        let picked = registry
            .select_adapter(AdapterStage::Synthesize, &SelectOptions::default())
            .await
            .unwrap();
        assert_eq!(picked.name(), "b");
    }

    #[tokio::test]
    async fn test_preferred_and_filters() {
        let registry = AdapterRegistry::new();
        registry
            .register(
                FakeAdapter::new("deepl", AdapterStage::Translate, true),
                config("deepl", AdapterStage::Translate, 5).with_languages(["es", "fr"]),
            )
            .await
            .unwrap();
        registry
            .register(
                FakeAdapter::new("mistral", AdapterStage::Translate, true),
                config("mistral", AdapterStage::Translate, 1),
            )
            .await
            .unwrap();

        let pick = |options: SelectOptions| {
            let registry = &registry;
            async move {
                registry
                    .select_adapter(AdapterStage::Translate, &options)
                    .await
                    .map(|a| a.name().to_string())
            }
        };

        assert_eq!(pick(SelectOptions::language("es")).await.as_deref(), Some("deepl"));
        assert_eq!(pick(SelectOptions::language("ja")).await.as_deref(), Some("mistral"));
        assert_eq!(
            pick(SelectOptions::language("es").preferred("mistral")).await.as_deref(),
            Some("mistral")
        );

        registry.set_enabled(AdapterStage::Translate, "mistral", false).await.unwrap();
        assert_eq!(
            pick(SelectOptions::default().preferred("mistral")).await.as_deref(),
            Some("deepl")
        );
        assert_eq!(pick(SelectOptions::language("ja")).await, None);
        assert!(registry
            .select_adapter(AdapterStage::LipSync, &SelectOptions::default())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_gpu_and_duration_constraints() {
        let registry = AdapterRegistry::new();
        let mut gpu = config("wav2lip", AdapterStage::LipSync, 10);
        gpu.capabilities.requires_gpu = true;
        gpu.capabilities.max_duration_secs = Some(60);
        registry
            .register(FakeAdapter::new("wav2lip", AdapterStage::LipSync, true), gpu)
            .await
            .unwrap();

        let no_gpu = SelectOptions {
            gpu_available: Some(false),
            ..SelectOptions::default()
        };
        assert!(registry.select_adapter(AdapterStage::LipSync, &no_gpu).await.is_none());

        let too_long = SelectOptions {
            duration_secs: Some(120),
            ..SelectOptions::default()
        };
        assert!(registry.select_adapter(AdapterStage::LipSync, &too_long).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_times_out_as_unhealthy() {
        let registry = AdapterRegistry::new().with_health_timeout(Duration::from_secs(2));
        registry
            .register(
                FakeAdapter::hanging("stuck", AdapterStage::VocalIsolation),
                config("stuck", AdapterStage::VocalIsolation, 1),
            )
            .await
            .unwrap();

        let health = registry
            .check_health(AdapterStage::VocalIsolation, "stuck")
            .await
            .unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.error.unwrap().contains("timed out"));

        assert!(registry
            .check_health(AdapterStage::VocalIsolation, "missing")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_update_config_and_summary() {
        let registry = AdapterRegistry::new();
        registry
            .register(
                FakeAdapter::new("whisper", AdapterStage::Transcribe, true),
                config("whisper", AdapterStage::Transcribe, 1),
            )
            .await
            .unwrap();

        let updated = registry
            .update_config(AdapterStage::Transcribe, "whisper", |c| c.priority = 7)
            .await
            .unwrap();
        assert_eq!(updated.priority, 7);
        assert!(registry
            .update_config(AdapterStage::Transcribe, "whisper", |c| c.version = "9".into())
            .await
            .is_err());

        registry.check_all_health().await;
        let summary = registry.summary().await;
        assert_eq!(summary.len(), AdapterStage::ALL.len());
        let stt = &summary[0];
        assert_eq!(stt.stage, AdapterStage::Transcribe);
        assert_eq!(stt.models[0].priority, 7);
        assert_eq!(stt.models[0].health, HealthStatus::Healthy);

        assert!(registry.unregister(AdapterStage::Transcribe, "whisper").await);
        assert!(registry.config(AdapterStage::Transcribe, "whisper").await.is_none());
    }
}
