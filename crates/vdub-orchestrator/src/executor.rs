//! Stage executor.
//!
//! Claims deliveries from the stage queues, runs the stage handler under a
//! time limit and reports the result back through the job manager or the
//! retry engine. A delivery is acked only once its result is recorded, so a
//! crash in between leads to redelivery rather than a lost job.
//!
//! While a handler runs its delivery lease is extended on every heartbeat.
//! If the lease is lost the attempt is abandoned unreported, since another
//! consumer now owns the delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use vdub_adapters::{AdapterRegistry, AdapterStage, SelectOptions};
use vdub_models::{Job, JobId, JobStatus, Stage, StageFailure, StageOutput, StagePayload};
use vdub_queue::{Delivery, QueueBackend};

use crate::config::ExecutorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::job_manager::JobManager;
use crate::logging::JobLogger;
use crate::retry_engine::RetryEngine;

/// Progress callback handed to a running stage handler.
#[derive(Clone)]
pub struct ProgressReporter {
    job_manager: Arc<JobManager>,
    job_id: JobId,
}

impl ProgressReporter {
    pub fn new(job_manager: Arc<JobManager>, job_id: JobId) -> Self {
        Self { job_manager, job_id }
    }

    /// Best effort; a failed update never fails the stage.
    pub async fn report(&self, percent: i32, metadata: Option<serde_json::Value>) {
        if let Err(e) = self.job_manager.update_progress(&self.job_id, percent, metadata).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to record progress");
        }
    }
}

/// Work performed for one stage.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn handle(
        &self,
        job: &Job,
        progress: &ProgressReporter,
    ) -> Result<Option<StageOutput>, StageFailure>;
}

/// Runs a stage by invoking the best registered model adapter.
pub struct AdapterStageHandler {
    stage: Stage,
    adapter_stage: AdapterStage,
    registry: Arc<AdapterRegistry>,
    preferred: Option<String>,
}

impl AdapterStageHandler {
    pub fn new(stage: Stage, registry: Arc<AdapterRegistry>) -> OrchestratorResult<Self> {
        let adapter_stage = AdapterStage::for_stage(stage).ok_or_else(|| {
            OrchestratorError::config_error(format!("{stage} stage is not served by model adapters"))
        })?;
        Ok(Self {
            stage,
            adapter_stage,
            registry,
            preferred: None,
        })
    }

    /// Try the named adapter first when it is enabled.
    pub fn with_preferred(mut self, name: impl Into<String>) -> Self {
        self.preferred = Some(name.into());
        self
    }

    fn language(payload: &StagePayload) -> Option<&str> {
        match payload {
            StagePayload::Transcribe(p) => Some(&p.source_language),
            StagePayload::Translate(p) => Some(&p.target_language),
            StagePayload::Synthesize(p) => Some(&p.target_language),
            StagePayload::Mux(_) | StagePayload::LipSync(_) => None,
        }
    }
}

#[async_trait]
impl StageHandler for AdapterStageHandler {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn handle(
        &self,
        job: &Job,
        progress: &ProgressReporter,
    ) -> Result<Option<StageOutput>, StageFailure> {
        let mut options = Self::language(&job.payload)
            .map(SelectOptions::language)
            .unwrap_or_default();
        if let Some(name) = &self.preferred {
            options = options.preferred(name.clone());
        }
        let adapter = self
            .registry
            .select_adapter(self.adapter_stage, &options)
            .await
            .ok_or_else(|| {
                StageFailure::resource(format!("no available adapter for {} stage", self.adapter_stage))
            })?;

        debug!(job_id = %job.id, adapter = adapter.name(), version = adapter.version(), "Invoking adapter");
        progress.report(10, None).await;

        let input = serde_json::to_value(&job.payload)
            .map_err(|e| StageFailure::permanent(format!("failed to encode payload: {e}")))?;
        let mut output = adapter
            .invoke(input)
            .await
            .map_err(|e| e.to_stage_failure())?;

        if let Some(fields) = output.as_object_mut() {
            fields
                .entry("stage")
                .or_insert_with(|| serde_json::Value::from(self.stage.as_str()));
        }
        let output: StageOutput = serde_json::from_value(output).map_err(|e| {
            StageFailure::permanent(format!("adapter {} returned invalid output: {e}", adapter.name()))
        })?;
        Ok(Some(output))
    }
}

type HandlerResult = Result<Option<StageOutput>, StageFailure>;

enum HandlerRun {
    Finished(HandlerResult),
    TimedOut,
    LeaseLost,
}

impl HandlerRun {
    fn from_timeout(result: Result<HandlerResult, tokio::time::error::Elapsed>) -> Self {
        match result {
            Ok(finished) => Self::Finished(finished),
            Err(_) => Self::TimedOut,
        }
    }
}

/// How one attempt ended.
enum Attempt {
    /// Output recorded through the job manager
    Recorded,
    /// To be reported to the retry engine
    Failed(StageFailure),
    /// Another consumer owns the delivery now
    LeaseLost,
}

/// Consumes stage queues and drives jobs through their handlers.
pub struct StageExecutor {
    config: ExecutorConfig,
    queue: Arc<dyn QueueBackend>,
    job_manager: Arc<JobManager>,
    retry_engine: Arc<RetryEngine>,
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
    semaphore: Arc<Semaphore>,
    consumer_name: String,
}

impl StageExecutor {
    pub fn new(
        config: ExecutorConfig,
        queue: Arc<dyn QueueBackend>,
        job_manager: Arc<JobManager>,
        retry_engine: Arc<RetryEngine>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            config,
            queue,
            job_manager,
            retry_engine,
            handlers: HashMap::new(),
            semaphore,
            consumer_name: format!("executor-{}", Uuid::new_v4()),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(handler.stage(), handler);
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<_> = self.handlers.keys().copied().collect();
        stages.sort();
        stages
    }

    /// Consume every handled stage until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> OrchestratorResult<()> {
        if self.handlers.is_empty() {
            return Err(OrchestratorError::config_error("executor has no stage handlers"));
        }
        self.config.validate(self.queue.visibility_timeout())?;

        info!(
            consumer = %self.consumer_name,
            stages = ?self.stages(),
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Starting stage executor"
        );

        let loops: Vec<_> = self
            .stages()
            .into_iter()
            .map(|stage| tokio::spawn(Arc::clone(&self).consume_loop(stage, shutdown.clone())))
            .collect();

        for handle in futures::future::join_all(loops).await {
            if let Err(e) = handle {
                error!(error = %e, "Stage consumer task panicked");
            }
        }

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "In-flight jobs still running at shutdown; they will be redelivered"
            );
        }

        info!("Stage executor stopped");
        Ok(())
    }

    async fn consume_loop(self: Arc<Self>, stage: Stage, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(stage = %stage, "Stage consumer stopping");
                        break;
                    }
                }
                result = Arc::clone(&self).consume(stage) => {
                    if let Err(e) = result {
                        error!(stage = %stage, error = %e, "Error consuming stage queue");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }

    async fn consume(self: Arc<Self>, stage: Stage) -> OrchestratorResult<()> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = self
            .queue
            .claim(stage, &self.consumer_name, available.min(self.config.claim_batch))
            .await?;
        if deliveries.is_empty() {
            tokio::time::sleep(self.config.poll_interval).await;
            return Ok(());
        }

        debug!(stage = %stage, count = deliveries.len(), "Claimed deliveries");
        for delivery in deliveries {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| OrchestratorError::invalid_state("executor semaphore closed"))?;
            let executor = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                let job_id = delivery.envelope.job_id.clone();
                if let Err(e) = executor.process_delivery(delivery).await {
                    error!(job_id = %job_id, error = %e, "Delivery left unacked for redelivery");
                }
            });
        }
        Ok(())
    }

    /// Run one delivery to a recorded result, then ack it.
    pub async fn process_delivery(&self, delivery: Delivery) -> OrchestratorResult<()> {
        let job_id = delivery.envelope.job_id.clone();

        let Some(mut job) = self.job_manager.get_job(&job_id).await? else {
            warn!(job_id = %job_id, "Delivery for unknown job, dropping");
            return self.ack(&delivery).await;
        };
        if job.status.is_terminal() {
            debug!(job_id = %job.id, status = %job.status, "Job already terminal, dropping delivery");
            return self.ack(&delivery).await;
        }

        if job.status == JobStatus::Pending {
            self.job_manager.mark_started(&job.id).await?;
            job = self
                .job_manager
                .get_job(&job_id)
                .await?
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;
        }

        let logger = JobLogger::new(&job);
        let span = logger.create_span();
        match self.execute(&job, &delivery, &logger).instrument(span).await {
            Attempt::Recorded => {}
            Attempt::Failed(failure) => {
                self.retry_engine.report_failure(&job.id, failure).await?;
            }
            Attempt::LeaseLost => {
                warn!(
                    job_id = %job.id,
                    delivery_id = %delivery.delivery_id,
                    "Delivery lease lost mid-attempt, abandoning it"
                );
                return Ok(());
            }
        }
        self.ack(&delivery).await
    }

    async fn execute(&self, job: &Job, delivery: &Delivery, logger: &JobLogger) -> Attempt {
        let Some(handler) = self.handlers.get(&job.stage) else {
            return Attempt::Failed(StageFailure::permanent(format!("no handler for {} stage", job.stage)));
        };

        if let Err(e) = job.payload.validate() {
            return Attempt::Failed(StageFailure::validation(e.to_string()));
        }

        let reporter = ProgressReporter::new(Arc::clone(&self.job_manager), job.id.clone());
        let output = match self.run_handler(handler.as_ref(), job, &reporter, delivery).await {
            HandlerRun::Finished(Ok(output)) => output,
            HandlerRun::Finished(Err(failure)) => {
                logger.log_warning(&format!("stage attempt failed: {failure}"));
                return Attempt::Failed(failure);
            }
            HandlerRun::TimedOut => {
                return Attempt::Failed(StageFailure::timeout(format!(
                    "{} stage timed out after {}s",
                    job.stage,
                    self.config.stage_timeout.as_secs()
                )));
            }
            HandlerRun::LeaseLost => return Attempt::LeaseLost,
        };

        match self.job_manager.mark_completed(&job.id, output).await {
            Ok(outcome) => {
                debug!(job_id = %job.id, outcome = ?outcome, "Stage result recorded");
                Attempt::Recorded
            }
            Err(e) => Attempt::Failed(StageFailure::with_kind(e.to_string(), e.kind())),
        }
    }

    /// Run the handler under the stage timeout, extending the delivery lease
    /// every heartbeat interval.
    async fn run_handler(
        &self,
        handler: &dyn StageHandler,
        job: &Job,
        reporter: &ProgressReporter,
        delivery: &Delivery,
    ) -> HandlerRun {
        let attempt = tokio::time::timeout(self.config.stage_timeout, handler.handle(job, reporter));
        let Some(every) = self.config.heartbeat_interval else {
            return HandlerRun::from_timeout(attempt.await);
        };

        tokio::pin!(attempt);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut attempt => return HandlerRun::from_timeout(result),
                _ = heartbeat.tick() => match self.queue.extend(delivery).await {
                    Ok(true) => debug!(job_id = %job.id, "Extended delivery lease"),
                    Ok(false) => return HandlerRun::LeaseLost,
                    // Keep going; the next beat may get through before the lease runs out
                    Err(e) => warn!(job_id = %job.id, error = %e, "Failed to extend delivery lease"),
                },
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> OrchestratorResult<()> {
        self.queue.ack(delivery).await?;
        Ok(())
    }

    async fn wait_for_jobs(&self) {
        loop {
            if self.semaphore.available_permits() == self.config.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Orchestrator;
    use crate::entitlement::StaticEntitlements;
    use crate::transitions::StageOutcome;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vdub_models::{Artifact, ArtifactStatus, ErrorKind, MuxPayload};
    use vdub_queue::RetryPolicy;
    use vdub_store::{ArtifactRepository, JobRepository};

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyMux {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StageHandler for FlakyMux {
        fn stage(&self) -> Stage {
            Stage::Mux
        }

        async fn handle(
            &self,
            _job: &Job,
            progress: &ProgressReporter,
        ) -> Result<Option<StageOutput>, StageFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(StageFailure::transient("connection reset by media service"));
            }
            progress.report(50, None).await;
            Ok(Some(StageOutput::Mux {
                video_url: "s3://out/final.mp4".into(),
                audio_url: "s3://dub.wav".into(),
            }))
        }
    }

    struct Hang;

    #[async_trait]
    impl StageHandler for Hang {
        fn stage(&self) -> Stage {
            Stage::Mux
        }

        async fn handle(&self, _: &Job, _: &ProgressReporter) -> Result<Option<StageOutput>, StageFailure> {
            std::future::pending().await
        }
    }

    /// Takes `duration` to produce a mux output.
    struct SlowMux {
        duration: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StageHandler for SlowMux {
        fn stage(&self) -> Stage {
            Stage::Mux
        }

        async fn handle(&self, _: &Job, _: &ProgressReporter) -> Result<Option<StageOutput>, StageFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.duration).await;
            Ok(Some(StageOutput::Mux {
                video_url: "s3://out/final.mp4".into(),
                audio_url: "s3://dub.wav".into(),
            }))
        }
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent_jobs: 2,
            claim_batch: 2,
            poll_interval: Duration::from_millis(50),
            stage_timeout: Duration::from_secs(30),
            heartbeat_interval: Some(Duration::from_secs(10)),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    async fn mux_job(env: &crate::service::InMemory) -> (Artifact, JobId) {
        let artifact = Artifact::new("user-1", "s3://in.mp4", "en", "es");
        ArtifactRepository::create(env.store.as_ref(), &artifact).await.unwrap();
        let job_id = env
            .orchestrator
            .job_manager
            .create_job(StagePayload::Mux(MuxPayload {
                artifact_id: artifact.id.clone(),
                user_id: artifact.user_id.clone(),
                video_url: artifact.video_url.clone(),
                audio_url: "s3://dub.wav".into(),
                apply_watermark: true,
            }))
            .await
            .unwrap();
        (artifact, job_id)
    }

    #[tokio::test]
    async fn test_successful_delivery_completes_and_acks() {
        let env = Orchestrator::in_memory(StaticEntitlements::new(), RetryPolicy::default());
        let (artifact, job_id) = mux_job(&env).await;
        let executor = env
            .orchestrator
            .executor(config())
            .with_handler(Arc::new(FlakyMux { failures: 0, calls: AtomicU32::new(0) }));

        let delivery = env.queue.claim(Stage::Mux, "t", 1).await.unwrap().pop().unwrap();
        executor.process_delivery(delivery).await.unwrap();

        let job = JobRepository::get(env.store.as_ref(), &job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(env.queue.in_flight_len(Stage::Mux).await.unwrap(), 0);
        let artifact = ArtifactRepository::get(env.store.as_ref(), &artifact.id).await.unwrap().unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_attempt_is_scheduled_for_retry() {
        let env = Orchestrator::in_memory(StaticEntitlements::new(), RetryPolicy::default());
        let (_artifact, job_id) = mux_job(&env).await;
        let executor = env
            .orchestrator
            .executor(config())
            .with_handler(Arc::new(FlakyMux { failures: 1, calls: AtomicU32::new(0) }));

        let delivery = env.queue.claim(Stage::Mux, "t", 1).await.unwrap().pop().unwrap();
        executor.process_delivery(delivery).await.unwrap();

        let job = JobRepository::get(env.store.as_ref(), &job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.error_history[0].kind, ErrorKind::Transient);
        assert_eq!(env.queue.in_flight_len(Stage::Mux).await.unwrap(), 0);
        assert_eq!(env.queue.delayed_len(Stage::Mux).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_handler_times_out() {
        let env = Orchestrator::in_memory(StaticEntitlements::new(), RetryPolicy::default());
        let (_artifact, job_id) = mux_job(&env).await;
        let executor = env.orchestrator.executor(config()).with_handler(Arc::new(Hang));

        let delivery = env.queue.claim(Stage::Mux, "t", 1).await.unwrap().pop().unwrap();
        executor.process_delivery(delivery).await.unwrap();

        let job = JobRepository::get(env.store.as_ref(), &job_id).await.unwrap().unwrap();
        assert_eq!(job.error_history.len(), 1);
        assert_eq!(job.error_history[0].kind, ErrorKind::Timeout);
        assert!(job.error_history[0].error.contains("timed out after 30s"));
    }

    #[tokio::test]
    async fn test_delivery_for_terminal_job_is_dropped() {
        let env = Orchestrator::in_memory(StaticEntitlements::new(), RetryPolicy::default());
        let (_artifact, job_id) = mux_job(&env).await;
        let executor = env
            .orchestrator
            .executor(config())
            .with_handler(Arc::new(FlakyMux { failures: 0, calls: AtomicU32::new(0) }));

        let delivery = env.queue.claim(Stage::Mux, "t", 1).await.unwrap().pop().unwrap();
        env.orchestrator.job_manager.mark_started(&job_id).await.unwrap();
        let outcome = env
            .orchestrator
            .job_manager
            .mark_completed(
                &job_id,
                Some(StageOutput::Mux {
                    video_url: "s3://x.mp4".into(),
                    audio_url: "s3://dub.wav".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::ArtifactCompleted);

        executor.process_delivery(delivery).await.unwrap();
        assert_eq!(env.queue.in_flight_len(Stage::Mux).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_retries_until_success_and_stops() {
        let env = Orchestrator::in_memory(StaticEntitlements::new(), RetryPolicy::default());
        let (_artifact, job_id) = mux_job(&env).await;
        let executor = Arc::new(
            env.orchestrator
                .executor(config())
                .with_handler(Arc::new(FlakyMux { failures: 2, calls: AtomicU32::new(0) })),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(Arc::clone(&executor).run(shutdown_rx));

        // Backoff is 5s then 15s
        tokio::time::sleep(Duration::from_secs(30)).await;
        let job = JobRepository::get(env.store.as_ref(), &job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.error_history.len(), 2);

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mux_has_no_adapter_handler() {
        let registry = Arc::new(AdapterRegistry::new());
        assert!(AdapterStageHandler::new(Stage::Mux, registry.clone()).is_err());
        assert!(AdapterStageHandler::new(Stage::Transcribe, registry).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_stage_outlives_visibility_timeout_without_redelivery() {
        let env = Orchestrator::in_memory(StaticEntitlements::new(), RetryPolicy::default());
        let (_artifact, job_id) = mux_job(&env).await;
        let handler = Arc::new(SlowMux {
            duration: Duration::from_secs(900),
            calls: AtomicU32::new(0),
        });
        let executor = Arc::new(
            env.orchestrator
                .executor(ExecutorConfig::default())
                .with_handler(handler.clone()),
        );
        assert!(ExecutorConfig::default().stage_timeout > env.queue.visibility_timeout());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(Arc::clone(&executor).run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(1000)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let job = JobRepository::get(env.store.as_ref(), &job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error_history.is_empty());

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lease_abandons_attempt_unreported() {
        let env = Orchestrator::in_memory(StaticEntitlements::new(), RetryPolicy::default());
        let (_artifact, job_id) = mux_job(&env).await;
        let executor = env.orchestrator.executor(config()).with_handler(Arc::new(SlowMux {
            duration: Duration::from_secs(25),
            calls: AtomicU32::new(0),
        }));

        let delivery = env.queue.claim(Stage::Mux, "t", 1).await.unwrap().pop().unwrap();
        // Settled elsewhere while this attempt runs
        env.queue.ack(&delivery).await.unwrap();

        let started = Instant::now();
        executor.process_delivery(delivery).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(25));

        let job = JobRepository::get(env.store.as_ref(), &job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.error_history.is_empty());
        assert_eq!(env.queue.delayed_len(Stage::Mux).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_rejects_timeout_beyond_visibility_without_heartbeat() {
        let env = Orchestrator::in_memory(StaticEntitlements::new(), RetryPolicy::default());
        let config = ExecutorConfig {
            heartbeat_interval: None,
            ..ExecutorConfig::default()
        };
        let executor = Arc::new(env.orchestrator.executor(config).with_handler(Arc::new(Hang)));

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = executor.run(shutdown_rx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }
}
