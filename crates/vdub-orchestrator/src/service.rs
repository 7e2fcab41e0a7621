//! Wiring for the orchestrator services.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use vdub_adapters::AdapterRegistry;
use vdub_models::Stage;
use vdub_queue::{
    DeadLetterRetention, DeadLetterStore, ErrorClassifier, MemoryDeadLetterStore, MemoryQueue,
    QueueBackend, RetryPolicy,
};
use vdub_store::{ArtifactRepository, ContextMapRepository, JobRepository, MemoryStore};

use crate::config::ExecutorConfig;
use crate::dead_letter::DeadLetterQueue;
use crate::entitlement::{EntitlementProvider, StaticEntitlements};
use crate::executor::StageExecutor;
use crate::job_manager::JobManager;
use crate::ledger::SegmentLedger;
use crate::metrics;
use crate::notifier::{outbox, Notifier, Outbox};
use crate::retry_engine::RetryEngine;

/// Storage and queue backends the services run on.
pub struct Backends<S> {
    pub store: Arc<S>,
    pub queue: Arc<dyn QueueBackend>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub entitlements: Arc<dyn EntitlementProvider>,
}

/// The orchestrator's services, sharing one set of backends.
pub struct Orchestrator {
    pub job_manager: Arc<JobManager>,
    pub retry_engine: Arc<RetryEngine>,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub ledger: Arc<SegmentLedger>,
    pub registry: Arc<AdapterRegistry>,
    pub queue: Arc<dyn QueueBackend>,
    pub notifier: Notifier,
}

impl Orchestrator {
    pub fn new<S>(
        backends: Backends<S>,
        registry: Arc<AdapterRegistry>,
        policy: RetryPolicy,
        retention: DeadLetterRetention,
        notifier: Notifier,
    ) -> Self
    where
        S: JobRepository + ArtifactRepository + ContextMapRepository + 'static,
    {
        let Backends {
            store,
            queue,
            dead_letters,
            entitlements,
        } = backends;

        let job_manager = Arc::new(JobManager::new(
            store.clone(),
            store.clone(),
            queue.clone(),
            dead_letters.clone(),
            entitlements,
            notifier.clone(),
        ));
        let dead_letters = Arc::new(DeadLetterQueue::new(
            dead_letters,
            job_manager.clone(),
            notifier.clone(),
            retention,
        ));
        let retry_engine = Arc::new(RetryEngine::new(
            store.clone(),
            queue.clone(),
            ErrorClassifier::new(),
            policy,
            job_manager.clone(),
            dead_letters.clone(),
            notifier.clone(),
        ));
        let ledger = Arc::new(SegmentLedger::new(store.clone(), store));

        Self {
            job_manager,
            retry_engine,
            dead_letters,
            ledger,
            registry,
            queue,
            notifier,
        }
    }

    /// Single-process orchestrator on in-memory backends.
    pub fn in_memory(entitlements: StaticEntitlements, policy: RetryPolicy) -> InMemory {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::default());
        let (notifier, outbox) = outbox(1024);
        let orchestrator = Self::new(
            Backends {
                store: store.clone(),
                queue: queue.clone(),
                dead_letters: Arc::new(MemoryDeadLetterStore::new()),
                entitlements: Arc::new(entitlements),
            },
            Arc::new(AdapterRegistry::new()),
            policy,
            DeadLetterRetention::default(),
            notifier,
        );
        InMemory {
            orchestrator,
            store,
            queue,
            outbox,
        }
    }

    /// Executor on this orchestrator's queue. Handlers are added by the caller.
    pub fn executor(&self, config: ExecutorConfig) -> StageExecutor {
        StageExecutor::new(
            config,
            self.queue.clone(),
            self.job_manager.clone(),
            self.retry_engine.clone(),
        )
    }

    /// Every `interval` until shutdown: clean finished entries older than
    /// `clean_grace` from each stage queue, then publish depth gauges.
    pub fn spawn_queue_maintenance(
        &self,
        interval: Duration,
        clean_grace: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for stage in Stage::ALL {
                            match queue.clean(stage, clean_grace).await {
                                Ok(0) => {}
                                Ok(removed) => metrics::record_queue_cleaned(stage, removed),
                                Err(e) => warn!(stage = %stage, error = %e, "Failed to clean queue"),
                            }
                        }
                        match queue.all_stats().await {
                            Ok(all) => all.iter().for_each(metrics::record_queue_stats),
                            Err(e) => warn!(error = %e, "Failed to read queue stats"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// In-memory orchestrator with handles on its backends.
pub struct InMemory {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub outbox: Outbox,
}
