//! Periodic adapter health probing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::AdapterRegistry;

pub struct HealthMonitor {
    registry: Arc<AdapterRegistry>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AdapterRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Probe every adapter once per interval until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Adapter health monitor started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let results = self.registry.check_all_health().await;
                        let unhealthy: usize = results
                            .values()
                            .flatten()
                            .filter(|h| !h.is_healthy())
                            .count();
                        debug!(
                            probed = results.values().map(Vec::len).sum::<usize>(),
                            unhealthy,
                            "Adapter health sweep finished"
                        );
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Adapter health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ModelAdapter;
    use crate::error::AdapterResult;
    use crate::types::{AdapterConfig, AdapterStage, HealthCheckResult, HealthStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingAdapter {
        probes: AtomicU32,
    }

    #[async_trait]
    impl ModelAdapter for CountingAdapter {
        fn name(&self) -> &str {
            "noisereduce"
        }

        fn version(&self) -> &str {
            "1.0"
        }

        fn stage(&self) -> AdapterStage {
            AdapterStage::VocalIsolation
        }

        async fn invoke(&self, input: serde_json::Value) -> AdapterResult<serde_json::Value> {
            Ok(input)
        }

        async fn health_check(&self) -> HealthCheckResult {
            self.probes.fetch_add(1, Ordering::SeqCst);
            HealthCheckResult::healthy(1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_probes_until_shutdown() {
        let registry = Arc::new(AdapterRegistry::new());
        let adapter = Arc::new(CountingAdapter {
            probes: AtomicU32::new(0),
        });
        registry
            .register(
                adapter.clone(),
                AdapterConfig::new("noisereduce", "1.0", AdapterStage::VocalIsolation),
            )
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = HealthMonitor::new(registry.clone(), Duration::from_secs(10)).spawn(rx);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(adapter.probes.load(Ordering::SeqCst), 3);
        assert_eq!(
            registry
                .health(AdapterStage::VocalIsolation, "noisereduce")
                .await
                .unwrap()
                .status,
            HealthStatus::Healthy
        );

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
