//! Failure handling for stage attempts.
//!
//! Every reported failure is classified, appended to the job's error history
//! and then either scheduled for a delayed retry, moved to the dead letter
//! queue once the attempt ceiling is reached, or failed outright.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use vdub_models::{AttemptError, ErrorKind, Job, JobId, JobStatus, PipelineEvent, StageFailure};
use vdub_queue::{ErrorClassifier, QueueBackend, QueueEnvelope, RetryDecision, RetryPolicy};
use vdub_store::JobRepository;

use crate::dead_letter::DeadLetterQueue;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::job_manager::{JobManager, JOB_WRITE_RETRIES};
use crate::logging::JobLogger;
use crate::metrics;
use crate::notifier::Notifier;

/// What happened to a reported failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Redelivery scheduled for `attempt` after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Attempts exhausted.
    DeadLettered { record_id: String },
    /// Not retryable.
    Failed,
    /// The job was already terminal.
    Ignored,
}

pub struct RetryEngine {
    jobs: Arc<dyn JobRepository>,
    queue: Arc<dyn QueueBackend>,
    classifier: ErrorClassifier,
    policy: RetryPolicy,
    job_manager: Arc<JobManager>,
    dead_letters: Arc<DeadLetterQueue>,
    notifier: Notifier,
}

impl RetryEngine {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        queue: Arc<dyn QueueBackend>,
        classifier: ErrorClassifier,
        policy: RetryPolicy,
        job_manager: Arc<JobManager>,
        dead_letters: Arc<DeadLetterQueue>,
        notifier: Notifier,
    ) -> Self {
        Self {
            jobs,
            queue,
            classifier,
            policy,
            job_manager,
            dead_letters,
            notifier,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handle a failed attempt of `job_id`.
    ///
    /// The attempt error and the retry bookkeeping are written with a
    /// revision check; if another write lands first the job is re-read and
    /// the failure recorded on top of it.
    pub async fn report_failure(
        &self,
        job_id: &JobId,
        failure: StageFailure,
    ) -> OrchestratorResult<FailureOutcome> {
        for write_attempt in 1..=JOB_WRITE_RETRIES {
            let mut job = self
                .jobs
                .get(job_id)
                .await?
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;

            if job.status.is_terminal() {
                debug!(job_id = %job.id, status = %job.status, "Failure reported for terminal job, ignoring");
                return Ok(FailureOutcome::Ignored);
            }

            let attempt = job.attempts.max(1);
            let classification = self.classifier.classify(&failure, job.stage, attempt);
            let decision = self.policy.decide(classification, attempt);
            job.record_attempt_error(AttemptError::new(attempt, &failure.message, classification.kind));

            // A Pending job that failed before start is promoted so the
            // retry is tracked as in progress.
            let expected = job.status;
            if job.status == JobStatus::Pending {
                job.start()?;
            }
            if let RetryDecision::Retry { next_attempt, .. } = decision {
                job.attempts = next_attempt;
            }

            if !self.jobs.compare_and_swap(&job, expected).await? {
                debug!(job_id = %job.id, write_attempt, "Job changed while recording a failure, re-reading");
                continue;
            }

            return self
                .settle(job, attempt, classification.kind, &failure, decision)
                .await;
        }

        Err(OrchestratorError::invalid_state(format!(
            "job {} kept changing while recording a failure",
            job_id
        )))
    }

    /// Act on a decision whose attempt error is already stored.
    async fn settle(
        &self,
        job: Job,
        attempt: u32,
        kind: ErrorKind,
        failure: &StageFailure,
        decision: RetryDecision,
    ) -> OrchestratorResult<FailureOutcome> {
        match decision {
            RetryDecision::Retry { delay, next_attempt } => {
                let envelope = QueueEnvelope::for_job(&job).retry(next_attempt);
                self.queue.enqueue_delayed(envelope, delay).await?;

                let delay_ms = delay.as_millis() as u64;
                JobLogger::new(&job).log_retry(attempt, self.policy.max_attempts, delay_ms, &failure.message);
                metrics::record_retry(job.stage, kind);
                self.notifier.send_to_user(
                    &job.user_id,
                    PipelineEvent::JobRetrying {
                        artifact_id: job.artifact_id.clone(),
                        job_id: job.id.clone(),
                        stage: job.stage,
                        attempt: next_attempt,
                        max_attempts: self.policy.max_attempts,
                        next_retry_in_ms: delay_ms,
                    },
                );
                Ok(FailureOutcome::Retrying {
                    attempt: next_attempt,
                    delay,
                })
            }
            RetryDecision::DeadLetter => {
                let reason = format!("Failed after {} attempts: {}", attempt, failure.message);
                let record = self.dead_letters.move_to_dead_letter(&job, &reason).await?;
                self.job_manager.mark_failed(&job.id, &reason).await?;
                Ok(FailureOutcome::DeadLettered {
                    record_id: record.id,
                })
            }
            RetryDecision::Fail => {
                let reason = format!("{}: {}", kind, failure.message);
                self.job_manager.mark_failed(&job.id, &reason).await?;
                Ok(FailureOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::StaticEntitlements;
    use crate::notifier::{outbox, Outbox};
    use async_trait::async_trait;
    use vdub_models::{
        Artifact, ArtifactId, ArtifactStatus, PipelineEventType, Stage, StagePayload,
        SynthesizePayload,
    };
    use vdub_queue::{DeadLetterRetention, MemoryDeadLetterStore, MemoryQueue};
    use vdub_store::{ArtifactRepository, MemoryStore, StoreResult};

    struct Fixture {
        engine: RetryEngine,
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        dead_letters: Arc<DeadLetterQueue>,
        outbox: Outbox,
        job: Job,
    }

    /// Job reads that take a while, so concurrent writers read the same
    /// revision before either writes.
    struct SlowReads {
        inner: Arc<MemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl JobRepository for SlowReads {
        async fn create(&self, job: &Job) -> StoreResult<()> {
            JobRepository::create(self.inner.as_ref(), job).await
        }

        async fn get(&self, id: &JobId) -> StoreResult<Option<Job>> {
            tokio::time::sleep(self.delay).await;
            JobRepository::get(self.inner.as_ref(), id).await
        }

        async fn update(&self, job: &Job) -> StoreResult<()> {
            self.inner.update(job).await
        }

        async fn compare_and_swap(&self, job: &Job, expected: JobStatus) -> StoreResult<bool> {
            JobRepository::compare_and_swap(self.inner.as_ref(), job, expected).await
        }

        async fn list_by_artifact(&self, artifact_id: &ArtifactId) -> StoreResult<Vec<Job>> {
            self.inner.list_by_artifact(artifact_id).await
        }

        async fn list_by_status(&self, status: JobStatus, stage: Option<Stage>) -> StoreResult<Vec<Job>> {
            self.inner.list_by_status(status, stage).await
        }

        async fn find_triggered_by(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
            self.inner.find_triggered_by(job_id).await
        }
    }

    struct Engine {
        engine: RetryEngine,
        manager: Arc<JobManager>,
        dead_letters: Arc<DeadLetterQueue>,
    }

    fn build(
        jobs: Arc<dyn JobRepository>,
        store: &Arc<MemoryStore>,
        queue: &Arc<MemoryQueue>,
        notifier: Notifier,
    ) -> Engine {
        let dlq_store = Arc::new(MemoryDeadLetterStore::new());
        let manager = Arc::new(JobManager::new(
            jobs.clone(),
            store.clone(),
            queue.clone(),
            dlq_store.clone(),
            Arc::new(StaticEntitlements::new()),
            notifier.clone(),
        ));
        let dead_letters = Arc::new(DeadLetterQueue::new(
            dlq_store,
            manager.clone(),
            notifier.clone(),
            DeadLetterRetention::default(),
        ));
        let engine = RetryEngine::new(
            jobs,
            queue.clone(),
            ErrorClassifier::new(),
            RetryPolicy::default(),
            manager.clone(),
            dead_letters.clone(),
            notifier,
        );
        Engine {
            engine,
            manager,
            dead_letters,
        }
    }

    async fn started_job(manager: &JobManager, store: &MemoryStore) -> Job {
        let artifact = Artifact::new("user-1", "s3://in.mp4", "en", "es");
        ArtifactRepository::create(store, &artifact).await.unwrap();
        let job_id = manager
            .create_job(StagePayload::Synthesize(SynthesizePayload {
                artifact_id: artifact.id.clone(),
                user_id: artifact.user_id.clone(),
                translation_id: "tr-1".into(),
                voice_config: serde_json::json!({"voice": "alloy"}),
                target_language: "es".into(),
            }))
            .await
            .unwrap();
        manager.mark_started(&job_id).await.unwrap();
        JobRepository::get(store, &job_id).await.unwrap().unwrap()
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::default());
        let (notifier, outbox) = outbox(256);
        let Engine {
            engine,
            manager,
            dead_letters,
        } = build(store.clone(), &store, &queue, notifier);
        let job = started_job(&manager, &store).await;

        Fixture {
            engine,
            store,
            queue,
            dead_letters,
            outbox,
            job,
        }
    }

    async fn reload(f: &Fixture) -> Job {
        JobRepository::get(f.store.as_ref(), &f.job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_then_dead_letter() {
        let mut f = fixture().await;

        let first = f
            .engine
            .report_failure(&f.job.id, StageFailure::new("ECONNREFUSED model service"))
            .await
            .unwrap();
        assert_eq!(
            first,
            FailureOutcome::Retrying {
                attempt: 2,
                delay: Duration::from_millis(5_000)
            }
        );
        let job = reload(&f).await;
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 2);
        assert_eq!(f.queue.delayed_len(Stage::Synthesize).await.unwrap(), 1);

        let second = f
            .engine
            .report_failure(&f.job.id, StageFailure::new("socket hang up"))
            .await
            .unwrap();
        assert_eq!(
            second,
            FailureOutcome::Retrying {
                attempt: 3,
                delay: Duration::from_millis(15_000)
            }
        );

        let third = f
            .engine
            .report_failure(&f.job.id, StageFailure::transient("503 from tts"))
            .await
            .unwrap();
        let record_id = match third {
            FailureOutcome::DeadLettered { record_id } => record_id,
            other => panic!("expected dead letter, got {other:?}"),
        };

        let job = reload(&f).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_history.len(), 3);
        assert_eq!(
            job.error_history.iter().map(|e| e.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let record = f.dead_letters.get(&record_id).await.unwrap().unwrap();
        assert_eq!(record.error_history.len(), 3);
        assert_eq!(record.attempts_made, 3);

        let artifact = ArtifactRepository::get(f.store.as_ref(), &job.artifact_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Failed);

        let types: Vec<_> = f
            .outbox
            .drain_pending()
            .into_iter()
            .map(|e| e.event.event_type())
            .collect();
        let dlq_pos = types
            .iter()
            .position(|t| *t == PipelineEventType::JobMovedToDeadLetter)
            .unwrap();
        let failed_pos = types
            .iter()
            .position(|t| *t == PipelineEventType::JobFailed)
            .unwrap();
        assert!(dlq_pos < failed_pos);
        assert_eq!(
            types.iter().filter(|t| **t == PipelineEventType::JobRetrying).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let f = fixture().await;
        let outcome = f
            .engine
            .report_failure(&f.job.id, StageFailure::new("invalid input: unknown voice id"))
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Failed);

        let job = reload(&f).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_history.len(), 1);
        assert_eq!(job.error_history[0].kind, ErrorKind::Validation);
        assert_eq!(f.queue.delayed_len(Stage::Synthesize).await.unwrap(), 0);
        assert_eq!(f.dead_letters.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_failure_on_terminal_job_is_ignored() {
        let f = fixture().await;
        f.engine
            .report_failure(&f.job.id, StageFailure::permanent("bad"))
            .await
            .unwrap();

        let outcome = f
            .engine
            .report_failure(&f.job.id, StageFailure::transient("late report"))
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Ignored);
        assert_eq!(reload(&f).await.error_history.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_job_is_an_error() {
        let f = fixture().await;
        let err = f
            .engine
            .report_failure(&JobId::from_string("missing"), StageFailure::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::JobNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_and_progress_reported_together_both_land() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::default());
        let (notifier, _outbox) = outbox(256);
        let slow: Arc<dyn JobRepository> = Arc::new(SlowReads {
            inner: store.clone(),
            delay: Duration::from_millis(10),
        });
        let built = build(slow, &store, &queue, notifier);
        let job = started_job(&built.manager, &store).await;

        let (outcome, progress) = tokio::join!(
            built
                .engine
                .report_failure(&job.id, StageFailure::new("ECONNREFUSED model service")),
            built.manager.update_progress(&job.id, 40, None),
        );
        assert!(matches!(outcome.unwrap(), FailureOutcome::Retrying { attempt: 2, .. }));
        assert_eq!(progress.unwrap(), 40);

        let stored = JobRepository::get(store.as_ref(), &job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.error_history.len(), 1);
        assert_eq!(stored.progress, 40);
        assert_eq!(queue.delayed_len(Stage::Synthesize).await.unwrap(), 1);
    }
}
