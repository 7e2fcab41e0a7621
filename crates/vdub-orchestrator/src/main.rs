//! Dubbing orchestrator binary.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use vdub_adapters::{AdapterRegistry, AdapterStage, HealthMonitor, HttpModelAdapter, RegistryConfigFile};
use vdub_queue::{EventChannel, RedisDeadLetterStore, RedisQueue};
use vdub_store::RedisStore;
use vdub_orchestrator::{
    logging, metrics, AdapterStageHandler, Backends, Orchestrator, OrchestratorConfig,
    RedisEventSink, StaticEntitlements,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    info!("Starting vdub-orchestrator");

    if let Err(e) = run().await {
        error!("Orchestrator error: {:#}", e);
        std::process::exit(1);
    }

    info!("Orchestrator shutdown complete");
}

async fn run() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env();
    info!("Orchestrator config: {:?}", config);

    metrics::init_metrics(config.metrics_addr).context("failed to start metrics exporter")?;

    let redis_url = config.queue.redis_url.clone();
    let prefix = config.queue.key_prefix.clone();

    let store = Arc::new(RedisStore::new(&redis_url, prefix.clone()).context("failed to open store")?);
    let queue = RedisQueue::new(config.queue.clone()).context("failed to create queue")?;
    queue.init().await.context("failed to initialize stage queues")?;
    let dead_letters =
        RedisDeadLetterStore::new(&redis_url, prefix.clone()).context("failed to open dead letter store")?;
    let events = EventChannel::new(&redis_url, prefix).context("failed to open event channel")?;
    let entitlements = StaticEntitlements::from_env().context("invalid entitlement settings")?;

    let loaded = build_registry(&config).await?;
    let registry = Arc::new(loaded.registry);

    let (notifier, outbox) = vdub_orchestrator::notifier::outbox(config.outbox_capacity);
    let orchestrator = Orchestrator::new(
        Backends {
            store,
            queue: Arc::new(queue),
            dead_letters: Arc::new(dead_letters),
            entitlements: Arc::new(entitlements),
        },
        registry.clone(),
        config.retry.clone(),
        config.retention,
        notifier,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = vec![
        outbox
            .into_dispatcher(Arc::new(RedisEventSink::new(events)))
            .spawn(shutdown_rx.clone()),
        HealthMonitor::new(registry.clone(), loaded.health_interval).spawn(shutdown_rx.clone()),
        orchestrator
            .dead_letters
            .clone()
            .spawn_purge_loop(config.dlq_purge_interval, shutdown_rx.clone()),
        orchestrator.spawn_queue_maintenance(
            config.queue_depth_interval,
            config.queue_clean_grace,
            shutdown_rx.clone(),
        ),
    ];

    if !config.executor_stages.is_empty() {
        config.executor.validate(config.queue.visibility_timeout)?;
        let mut executor = orchestrator.executor(config.executor.clone());
        for stage in &config.executor_stages {
            match AdapterStageHandler::new(*stage, registry.clone()) {
                Ok(mut handler) => {
                    let default = AdapterStage::for_stage(*stage).and_then(|s| loaded.defaults.get(&s));
                    if let Some(name) = default {
                        handler = handler.with_preferred(name.clone());
                    }
                    executor = executor.with_handler(Arc::new(handler));
                }
                Err(e) => warn!(stage = %stage, error = %e, "Skipping stage without a local handler"),
            }
        }
        if executor.stages().is_empty() {
            warn!("No executable stages configured, running control plane only");
        } else {
            let executor = Arc::new(executor);
            let rx = shutdown_rx.clone();
            background.push(tokio::spawn(async move {
                if let Err(e) = executor.run(rx).await {
                    error!(error = %e, "Stage executor stopped with error");
                }
            }));
        }
    }

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    for handle in futures::future::join_all(background).await {
        if let Err(e) = handle {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    Ok(())
}

struct LoadedRegistry {
    registry: AdapterRegistry,
    health_interval: Duration,
    /// Default adapter name per stage
    defaults: BTreeMap<AdapterStage, String>,
}

/// Build the adapter registry from the configured registry file.
async fn build_registry(config: &OrchestratorConfig) -> anyhow::Result<LoadedRegistry> {
    let Some(path) = &config.adapter_config_path else {
        warn!("ADAPTER_CONFIG_PATH not set, starting with an empty adapter registry");
        return Ok(LoadedRegistry {
            registry: AdapterRegistry::new().with_health_timeout(config.health_check_timeout),
            health_interval: config.health_check_interval,
            defaults: BTreeMap::new(),
        });
    };

    let file = RegistryConfigFile::load(path)
        .await
        .with_context(|| format!("failed to load adapter config {}", path.display()))?;
    let registry = AdapterRegistry::new().with_health_timeout(file.health_check.timeout());

    for adapter_config in file.models.values().flatten() {
        if adapter_config.url.is_none() {
            warn!(adapter = %adapter_config.key(), "Adapter has no url, not registered");
            continue;
        }
        let adapter = HttpModelAdapter::from_config(adapter_config)?;
        registry
            .register(Arc::new(adapter), adapter_config.clone())
            .await
            .with_context(|| format!("failed to register adapter {}", adapter_config.key()))?;
    }

    info!(adapters = registry.len().await, path = %path.display(), "Adapter registry loaded");
    Ok(LoadedRegistry {
        registry,
        health_interval: file.health_check.interval(),
        defaults: file.defaults,
    })
}
