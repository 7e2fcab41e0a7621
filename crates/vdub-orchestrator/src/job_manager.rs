//! Job manager.
//!
//! The only writer of job lifecycle state. Workers report back through these
//! operations; status changes are compare-and-swap writes so a duplicate or
//! late report can never move a job backwards or run a transition twice.

use std::sync::Arc;

use tracing::{debug, info, warn};

use vdub_models::{
    Artifact, ArtifactId, ArtifactStatus, Job, JobId, JobStatus, PipelineEvent, Stage,
    StageOutput, StagePayload, SynthesizePayload, TranscribePayload, TranslatePayload,
};
use vdub_queue::{DeadLetterRecord, DeadLetterStore, QueueBackend, QueueEnvelope};
use vdub_store::{ArtifactRepository, JobRepository, StoreError};

use crate::entitlement::{Capability, EntitlementProvider};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::notifier::Notifier;
use crate::transitions::{self, StageOutcome, Transition};

/// Re-reads allowed when a same-status write races another writer.
pub(crate) const JOB_WRITE_RETRIES: u32 = 5;

pub struct JobManager {
    jobs: Arc<dyn JobRepository>,
    artifacts: Arc<dyn ArtifactRepository>,
    queue: Arc<dyn QueueBackend>,
    dead_letters: Arc<dyn DeadLetterStore>,
    entitlements: Arc<dyn EntitlementProvider>,
    notifier: Notifier,
}

impl JobManager {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        artifacts: Arc<dyn ArtifactRepository>,
        queue: Arc<dyn QueueBackend>,
        dead_letters: Arc<dyn DeadLetterStore>,
        entitlements: Arc<dyn EntitlementProvider>,
        notifier: Notifier,
    ) -> Self {
        Self {
            jobs,
            artifacts,
            queue,
            dead_letters,
            entitlements,
            notifier,
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Persist a PENDING job for `payload` and enqueue it on its stage queue.
    pub async fn create_job(&self, payload: StagePayload) -> OrchestratorResult<JobId> {
        payload.validate()?;
        let artifact = self.artifact(payload.artifact_id()).await?;
        self.submit(Job::new(payload), &artifact).await
    }

    /// Create a fresh job from an earlier job's payload.
    ///
    /// Used for manual retries and dead letter replays; the source job is
    /// left untouched.
    pub async fn resubmit(&self, source: &Job) -> OrchestratorResult<JobId> {
        source.payload.validate()?;
        let artifact = self.artifact(&source.artifact_id).await?;
        let mut job = Job::new(source.payload.clone()).retry_of(source.id.clone());
        job.retry_count = source.retry_count;
        self.submit(job, &artifact).await
    }

    async fn submit(&self, job: Job, artifact: &Artifact) -> OrchestratorResult<JobId> {
        self.jobs.create(&job).await?;

        if let Err(e) = self.queue.enqueue(QueueEnvelope::for_job(&job)).await {
            // No PENDING job may exist without a queue entry.
            warn!(job_id = %job.id, stage = %job.stage, error = %e, "Enqueue failed, failing job");
            let mut orphan = job.clone();
            if orphan.start().is_ok() && orphan.fail(format!("Enqueue failed: {e}")).is_ok() {
                self.jobs.update(&orphan).await?;
            }
            return Err(e.into());
        }

        self.artifacts
            .set_status(&artifact.id, ArtifactStatus::Processing(job.stage))
            .await?;

        info!(
            job_id = %job.id,
            artifact_id = %job.artifact_id,
            stage = %job.stage,
            retry_of = job.retry_of.as_ref().map(|id| id.as_str()),
            "Created stage job"
        );
        metrics::record_job_created(job.stage);
        self.notifier.send_to_user(
            &job.user_id,
            PipelineEvent::JobCreated {
                artifact_id: job.artifact_id.clone(),
                job_id: job.id.clone(),
                stage: job.stage,
            },
        );
        Ok(job.id)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// PENDING -> PROCESSING. Returns false (with a warning) for any other
    /// current status.
    pub async fn mark_started(&self, job_id: &JobId) -> OrchestratorResult<bool> {
        let mut job = self.job(job_id).await?;
        let logger = JobLogger::new(&job);

        if job.status != JobStatus::Pending {
            logger.log_warning(&format!("cannot start a job in status {}", job.status));
            return Ok(false);
        }

        job.start()?;
        if !self.swap(&mut job, JobStatus::Pending).await? {
            logger.log_warning("job was started concurrently");
            return Ok(false);
        }

        logger.log_start(job.attempts);
        metrics::record_job_started(job.stage);
        self.notifier.send_to_user(
            &job.user_id,
            PipelineEvent::JobStarted {
                artifact_id: job.artifact_id.clone(),
                job_id: job.id.clone(),
                stage: job.stage,
            },
        );
        Ok(true)
    }

    /// Record progress for a PROCESSING job. Out-of-range values are clamped.
    ///
    /// Re-reads the job when another write lands in between, so a progress
    /// report never overwrites an attempt recorded concurrently.
    pub async fn update_progress(
        &self,
        job_id: &JobId,
        percent: i32,
        metadata: Option<serde_json::Value>,
    ) -> OrchestratorResult<u8> {
        for attempt in 1..=JOB_WRITE_RETRIES {
            let mut job = self.job(job_id).await?;
            if job.status != JobStatus::Processing {
                return Err(OrchestratorError::invalid_state(format!(
                    "progress reported for job {} in status {}",
                    job.id, job.status
                )));
            }

            let clamped = job.set_progress(percent);
            if metadata.is_some() {
                job.progress_metadata = metadata.clone();
            }

            if !self.swap(&mut job, JobStatus::Processing).await? {
                debug!(job_id = %job.id, attempt, "Job changed during progress update, re-reading");
                continue;
            }

            let logger = JobLogger::new(&job);
            if let Some(clamped) = clamped {
                logger.log_warning(&format!("progress {percent} out of range, clamped to {clamped}"));
            }
            logger.log_progress(job.progress);
            self.notifier.send_to_user(
                &job.user_id,
                PipelineEvent::JobProgress {
                    artifact_id: job.artifact_id.clone(),
                    job_id: job.id.clone(),
                    stage: job.stage,
                    progress: job.progress,
                },
            );
            return Ok(job.progress);
        }

        Err(OrchestratorError::invalid_state(format!(
            "job {} kept changing during a progress update",
            job_id
        )))
    }

    /// PROCESSING -> COMPLETED, then run the stage transition.
    ///
    /// Completing an already completed job is a no-op.
    pub async fn mark_completed(
        &self,
        job_id: &JobId,
        output: Option<StageOutput>,
    ) -> OrchestratorResult<StageOutcome> {
        for attempt in 1..=JOB_WRITE_RETRIES {
            let mut job = self.job(job_id).await?;

            if job.status == JobStatus::Completed {
                debug!(job_id = %job.id, "Job already completed, ignoring duplicate completion");
                return Ok(StageOutcome::AlreadyCompleted);
            }

            if let Some(out) = &output {
                if out.stage() != job.stage {
                    return Err(vdub_models::ModelError::StageMismatch {
                        expected: job.stage,
                        actual: out.stage(),
                    }
                    .into());
                }
            } else if transitions::requires_output(job.stage) {
                return Err(OrchestratorError::invalid_state(format!(
                    "{} job {} must report its output",
                    job.stage, job.id
                )));
            }

            job.complete(output.clone())?;
            if !self.swap(&mut job, JobStatus::Processing).await? {
                debug!(job_id = %job.id, attempt, "Job changed during completion, re-reading");
                continue;
            }

            JobLogger::new(&job).log_completion();
            let duration = job
                .started_at
                .zip(job.completed_at)
                .and_then(|(start, end)| (end - start).to_std().ok())
                .map(|d| d.as_secs_f64());
            metrics::record_job_completed(job.stage, duration);
            self.notifier.send_to_user(
                &job.user_id,
                PipelineEvent::JobCompleted {
                    artifact_id: job.artifact_id.clone(),
                    job_id: job.id.clone(),
                    stage: job.stage,
                },
            );

            return self.advance(&job).await;
        }

        Err(OrchestratorError::invalid_state(format!(
            "job {} kept changing during completion",
            job_id
        )))
    }

    /// PROCESSING -> FAILED; the artifact fails with it.
    ///
    /// Retry decisions are made before this is called.
    pub async fn mark_failed(&self, job_id: &JobId, reason: &str) -> OrchestratorResult<Job> {
        for attempt in 1..=JOB_WRITE_RETRIES {
            let mut job = self.job(job_id).await?;
            if job.status == JobStatus::Failed {
                debug!(job_id = %job.id, "Job already failed");
                return Ok(job);
            }

            job.fail(reason)?;
            if !self.swap(&mut job, JobStatus::Processing).await? {
                debug!(job_id = %job.id, attempt, "Job changed while failing, re-reading");
                continue;
            }

            self.artifacts
                .set_status(&job.artifact_id, ArtifactStatus::Failed)
                .await?;

            JobLogger::new(&job).log_error(reason);
            metrics::record_job_failed(job.stage);
            self.notifier.send_to_user(
                &job.user_id,
                PipelineEvent::JobFailed {
                    artifact_id: job.artifact_id.clone(),
                    job_id: job.id.clone(),
                    stage: job.stage,
                    error: reason.to_string(),
                },
            );
            return Ok(job);
        }

        Err(OrchestratorError::invalid_state(format!(
            "job {} kept changing while failing",
            job_id
        )))
    }

    /// Create a new job from a FAILED one. The failed job only gets its
    /// retry counter bumped.
    ///
    /// A job still held in the dead letter queue is replayed from there
    /// instead, so one failure never spawns two jobs.
    pub async fn retry_job(&self, job_id: &JobId) -> OrchestratorResult<JobId> {
        let mut job = self.job(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(OrchestratorError::invalid_state(format!(
                "only failed jobs can be retried, job {} is {}",
                job.id, job.status
            )));
        }

        let record_id = DeadLetterRecord::record_id(job.stage, &job.id);
        if self.dead_letters.get(&record_id).await?.is_some() {
            return Err(OrchestratorError::invalid_state(format!(
                "job {} is in the dead letter queue, replay record {} instead",
                job.id, record_id
            )));
        }

        job.retry_count += 1;
        job.updated_at = chrono::Utc::now();
        if !self.swap(&mut job, JobStatus::Failed).await? {
            return Err(OrchestratorError::invalid_state(format!(
                "job {} changed during retry",
                job.id
            )));
        }

        self.resubmit(&job).await
    }

    // =========================================================================
    // Stage transitions
    // =========================================================================

    async fn advance(&self, job: &Job) -> OrchestratorResult<StageOutcome> {
        let artifact = self.artifact(&job.artifact_id).await?;

        match transitions::transition_for(job.stage) {
            Transition::Review(stage) => {
                self.artifacts
                    .set_status(&artifact.id, ArtifactStatus::Review(stage))
                    .await?;
                metrics::record_transition(job.stage, "review");
                info!(artifact_id = %artifact.id, stage = %stage, "Artifact ready for review");
                self.notifier.send_to_user(
                    &artifact.user_id,
                    PipelineEvent::ready_for_review(artifact.id.clone(), stage),
                );
                Ok(StageOutcome::Review { stage })
            }
            Transition::Advance(next) => self.spawn_next(job, &artifact, next).await,
            Transition::AdvanceIfEntitled { next, capability } => {
                if self.entitled(&artifact.user_id, capability).await {
                    self.spawn_next(job, &artifact, next).await
                } else {
                    self.complete_artifact(job, &artifact, "Video dubbing completed successfully")
                        .await
                }
            }
            Transition::Complete => {
                self.complete_artifact(
                    job,
                    &artifact,
                    "Video dubbing with lip-sync completed successfully",
                )
                .await
            }
        }
    }

    async fn spawn_next(
        &self,
        completed: &Job,
        artifact: &Artifact,
        next: Stage,
    ) -> OrchestratorResult<StageOutcome> {
        if let Some(existing) = self.jobs.find_triggered_by(&completed.id).await? {
            debug!(job_id = %completed.id, next_job_id = %existing.id, "Next stage already spawned");
            return Ok(StageOutcome::Advanced {
                stage: existing.stage,
                job_id: existing.id,
            });
        }

        let apply_watermark = next == Stage::Mux
            && !self.entitled(&artifact.user_id, Capability::WatermarkFree).await;
        let payload = transitions::next_payload(next, artifact, completed, apply_watermark)?;
        payload.validate()?;
        let job = Job::new(payload).triggered_by(completed.id.clone());

        match self.submit(job, artifact).await {
            Ok(job_id) => {
                metrics::record_transition(completed.stage, next.as_str());
                Ok(StageOutcome::Advanced { stage: next, job_id })
            }
            Err(OrchestratorError::Store(StoreError::DuplicateTrigger(_))) => {
                let existing = self.jobs.find_triggered_by(&completed.id).await?.ok_or_else(|| {
                    OrchestratorError::invalid_state(format!(
                        "job {} reported a follow-up that does not exist",
                        completed.id
                    ))
                })?;
                Ok(StageOutcome::Advanced {
                    stage: existing.stage,
                    job_id: existing.id,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn complete_artifact(
        &self,
        job: &Job,
        artifact: &Artifact,
        message: &str,
    ) -> OrchestratorResult<StageOutcome> {
        self.artifacts
            .set_status(&artifact.id, ArtifactStatus::Completed)
            .await?;
        metrics::record_transition(job.stage, "completed");
        info!(artifact_id = %artifact.id, stage = %job.stage, "Artifact completed");
        self.notifier.send_to_user(
            &artifact.user_id,
            PipelineEvent::artifact_completed(artifact.id.clone(), message),
        );
        Ok(StageOutcome::ArtifactCompleted)
    }

    /// A failing entitlement lookup counts as "not entitled".
    async fn entitled(&self, user_id: &str, capability: Capability) -> bool {
        match self.entitlements.has_capability(user_id, capability).await {
            Ok(granted) => granted,
            Err(e) => {
                warn!(user_id, capability = %capability, error = %e, "Entitlement lookup failed");
                false
            }
        }
    }

    // =========================================================================
    // Artifact checkpoints
    // =========================================================================

    /// Start the pipeline for an artifact with its extracted audio.
    pub async fn start_transcription(
        &self,
        artifact_id: &ArtifactId,
        audio_url: &str,
    ) -> OrchestratorResult<JobId> {
        let artifact = self.artifact(artifact_id).await?;
        if matches!(
            artifact.status,
            ArtifactStatus::Processing(_) | ArtifactStatus::Review(_)
        ) {
            return Err(OrchestratorError::invalid_state(format!(
                "artifact {} is already {}",
                artifact.id, artifact.status
            )));
        }

        let payload = StagePayload::Transcribe(TranscribePayload {
            artifact_id: artifact.id.clone(),
            user_id: artifact.user_id.clone(),
            audio_url: audio_url.to_string(),
            source_language: artifact.source_language.clone(),
            target_language: Some(artifact.target_language.clone()),
        });
        payload.validate()?;
        self.submit(Job::new(payload), &artifact).await
    }

    /// Owner accepted the transcript; start translation.
    pub async fn confirm_transcript(
        &self,
        artifact_id: &ArtifactId,
        transcript_id: &str,
        glossary_enabled: bool,
    ) -> OrchestratorResult<JobId> {
        let artifact = self.artifact(artifact_id).await?;
        let payload = StagePayload::Translate(TranslatePayload {
            artifact_id: artifact.id.clone(),
            user_id: artifact.user_id.clone(),
            transcript_id: transcript_id.to_string(),
            source_language: artifact.source_language.clone(),
            target_language: artifact.target_language.clone(),
            glossary_enabled,
        });
        self.confirm(&artifact, Stage::Transcribe, payload).await
    }

    /// Owner accepted the translation; start synthesis.
    pub async fn confirm_translation(
        &self,
        artifact_id: &ArtifactId,
        translation_id: &str,
        voice_config: serde_json::Value,
    ) -> OrchestratorResult<JobId> {
        let artifact = self.artifact(artifact_id).await?;
        let payload = StagePayload::Synthesize(SynthesizePayload {
            artifact_id: artifact.id.clone(),
            user_id: artifact.user_id.clone(),
            translation_id: translation_id.to_string(),
            voice_config,
            target_language: artifact.target_language.clone(),
        });
        self.confirm(&artifact, Stage::Translate, payload).await
    }

    async fn confirm(
        &self,
        artifact: &Artifact,
        reviewed: Stage,
        payload: StagePayload,
    ) -> OrchestratorResult<JobId> {
        payload.validate()?;
        let next = payload.stage();

        let claimed = self
            .artifacts
            .compare_and_set_status(
                &artifact.id,
                ArtifactStatus::Review(reviewed),
                ArtifactStatus::Processing(next),
            )
            .await?;
        if !claimed {
            return Err(OrchestratorError::invalid_state(format!(
                "artifact {} is not awaiting {} review",
                artifact.id, reviewed
            )));
        }

        info!(artifact_id = %artifact.id, stage = %reviewed, "Review confirmed");
        metrics::record_transition(reviewed, next.as_str());
        self.submit(Job::new(payload), artifact).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_job(&self, job_id: &JobId) -> OrchestratorResult<Option<Job>> {
        Ok(self.jobs.get(job_id).await?)
    }

    /// Jobs of an artifact in creation order.
    pub async fn jobs_for_artifact(&self, artifact_id: &ArtifactId) -> OrchestratorResult<Vec<Job>> {
        Ok(self.jobs.list_by_artifact(artifact_id).await?)
    }

    /// Most recently created PENDING or PROCESSING job of an artifact.
    pub async fn current_job(&self, artifact_id: &ArtifactId) -> OrchestratorResult<Option<Job>> {
        let jobs = self.jobs.list_by_artifact(artifact_id).await?;
        Ok(jobs.into_iter().rev().find(|j| !j.status.is_terminal()))
    }

    pub async fn get_artifact(&self, artifact_id: &ArtifactId) -> OrchestratorResult<Option<Artifact>> {
        Ok(self.artifacts.get(artifact_id).await?)
    }

    /// Conditional job write; on success `job` carries the stored revision.
    async fn swap(&self, job: &mut Job, expected: JobStatus) -> OrchestratorResult<bool> {
        let applied = self.jobs.compare_and_swap(job, expected).await?;
        if applied {
            job.revision += 1;
        }
        Ok(applied)
    }

    async fn job(&self, job_id: &JobId) -> OrchestratorResult<Job> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))
    }

    async fn artifact(&self, artifact_id: &ArtifactId) -> OrchestratorResult<Artifact> {
        self.artifacts
            .get(artifact_id)
            .await?
            .ok_or_else(|| OrchestratorError::ArtifactNotFound(artifact_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::StaticEntitlements;
    use crate::notifier::{outbox, Outbox};
    use vdub_models::{MuxPayload, PipelineEventType};
    use vdub_queue::{MemoryDeadLetterStore, MemoryQueue};
    use vdub_store::MemoryStore;

    struct Fixture {
        manager: JobManager,
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        dead_letters: Arc<MemoryDeadLetterStore>,
        outbox: Outbox,
        artifact: Artifact,
    }

    async fn fixture(entitlements: StaticEntitlements) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::default());
        let (notifier, outbox) = outbox(256);
        let dead_letters = Arc::new(MemoryDeadLetterStore::new());
        let manager = JobManager::new(
            store.clone(),
            store.clone(),
            queue.clone(),
            dead_letters.clone(),
            Arc::new(entitlements),
            notifier,
        );

        let artifact = Artifact::new("user-1", "s3://in/video.mp4", "en", "es");
        ArtifactRepository::create(store.as_ref(), &artifact).await.unwrap();
        Fixture {
            manager,
            store,
            queue,
            dead_letters,
            outbox,
            artifact,
        }
    }

    fn mux_payload(artifact: &Artifact) -> StagePayload {
        StagePayload::Mux(MuxPayload {
            artifact_id: artifact.id.clone(),
            user_id: artifact.user_id.clone(),
            video_url: artifact.video_url.clone(),
            audio_url: "s3://dub.wav".into(),
            apply_watermark: true,
        })
    }

    fn mux_output() -> StageOutput {
        StageOutput::Mux {
            video_url: "s3://out/muxed.mp4".into(),
            audio_url: "s3://dub.wav".into(),
        }
    }

    async fn artifact_status(f: &Fixture) -> ArtifactStatus {
        ArtifactRepository::get(f.store.as_ref(), &f.artifact.id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_create_job_persists_enqueues_and_notifies() {
        let mut f = fixture(StaticEntitlements::new()).await;
        let job_id = f.manager.create_job(mux_payload(&f.artifact)).await.unwrap();

        let job = f.manager.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.stage, Stage::Mux);
        assert_eq!(f.queue.len(Stage::Mux).await.unwrap(), 1);
        assert_eq!(artifact_status(&f).await, ArtifactStatus::Processing(Stage::Mux));

        let events = f.outbox.drain_pending();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.event_type(), PipelineEventType::JobCreated);
        assert_eq!(events[0].user_id, "user-1");
    }

    #[tokio::test]
    async fn test_create_job_requires_artifact_and_valid_payload() {
        let f = fixture(StaticEntitlements::new()).await;

        let mut orphan = Artifact::new("user-1", "v.mp4", "en", "es");
        orphan.id = ArtifactId::from_string("missing");
        let err = f.manager.create_job(mux_payload(&orphan)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ArtifactNotFound(_)));

        let mut payload = mux_payload(&f.artifact);
        if let StagePayload::Mux(p) = &mut payload {
            p.audio_url.clear();
        }
        let err = f.manager.create_job(payload).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(f.queue.len(Stage::Mux).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_started_only_from_pending() {
        let f = fixture(StaticEntitlements::new()).await;
        let job_id = f.manager.create_job(mux_payload(&f.artifact)).await.unwrap();

        assert!(f.manager.mark_started(&job_id).await.unwrap());
        assert!(!f.manager.mark_started(&job_id).await.unwrap());

        let job = f.manager.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn test_progress_is_clamped_and_requires_processing() {
        let f = fixture(StaticEntitlements::new()).await;
        let job_id = f.manager.create_job(mux_payload(&f.artifact)).await.unwrap();

        assert!(f.manager.update_progress(&job_id, 50, None).await.is_err());

        f.manager.mark_started(&job_id).await.unwrap();
        assert_eq!(f.manager.update_progress(&job_id, 140, None).await.unwrap(), 100);
        assert_eq!(
            f.manager
                .update_progress(&job_id, -5, Some(serde_json::json!({ "segment": 3 })))
                .await
                .unwrap(),
            0
        );
        let job = f.manager.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.progress, 0);
        assert_eq!(job.progress_metadata.unwrap()["segment"], 3);
    }

    #[tokio::test]
    async fn test_mux_without_lipsync_completes_artifact() {
        let f = fixture(StaticEntitlements::new()).await;
        let job_id = f.manager.create_job(mux_payload(&f.artifact)).await.unwrap();
        f.manager.mark_started(&job_id).await.unwrap();

        let outcome = f.manager.mark_completed(&job_id, Some(mux_output())).await.unwrap();
        assert_eq!(outcome, StageOutcome::ArtifactCompleted);
        assert_eq!(artifact_status(&f).await, ArtifactStatus::Completed);
        assert_eq!(f.queue.len(Stage::LipSync).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mux_with_lipsync_advances_once() {
        let f = fixture(StaticEntitlements::new().grant("user-1", Capability::LipSync)).await;
        let job_id = f.manager.create_job(mux_payload(&f.artifact)).await.unwrap();
        f.manager.mark_started(&job_id).await.unwrap();

        let first = f.manager.mark_completed(&job_id, Some(mux_output())).await.unwrap();
        let StageOutcome::Advanced { stage, job_id: next_id } = first else {
            panic!("expected advance, got {first:?}");
        };
        assert_eq!(stage, Stage::LipSync);

        let second = f.manager.mark_completed(&job_id, Some(mux_output())).await.unwrap();
        assert_eq!(second, StageOutcome::AlreadyCompleted);
        assert_eq!(f.queue.len(Stage::LipSync).await.unwrap(), 1);

        let next = f.manager.get_job(&next_id).await.unwrap().unwrap();
        assert_eq!(next.triggered_by.as_ref(), Some(&job_id));
        match next.payload {
            StagePayload::LipSync(p) => assert_eq!(p.video_url, "s3://out/muxed.mp4"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_completions_trigger_once() {
        let f = fixture(StaticEntitlements::new().grant("user-1", Capability::LipSync)).await;
        let job_id = f.manager.create_job(mux_payload(&f.artifact)).await.unwrap();
        f.manager.mark_started(&job_id).await.unwrap();

        let (a, b) = tokio::join!(
            f.manager.mark_completed(&job_id, Some(mux_output())),
            f.manager.mark_completed(&job_id, Some(mux_output())),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, StageOutcome::Advanced { .. }))
                .count(),
            1
        );
        assert_eq!(f.queue.len(Stage::LipSync).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_completion_output_is_checked() {
        let f = fixture(StaticEntitlements::new()).await;
        let job_id = f.manager.create_job(mux_payload(&f.artifact)).await.unwrap();
        f.manager.mark_started(&job_id).await.unwrap();

        assert!(f.manager.mark_completed(&job_id, None).await.is_err());
        let wrong = StageOutput::LipSync {
            video_url: "x".into(),
        };
        assert!(matches!(
            f.manager.mark_completed(&job_id, Some(wrong)).await,
            Err(OrchestratorError::Model(_))
        ));
        let job = f.manager.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_mark_failed_fails_artifact_and_retry_creates_new_job() {
        let f = fixture(StaticEntitlements::new()).await;
        let job_id = f.manager.create_job(mux_payload(&f.artifact)).await.unwrap();

        assert!(f.manager.retry_job(&job_id).await.is_err());

        f.manager.mark_started(&job_id).await.unwrap();
        let failed = f.manager.mark_failed(&job_id, "ffmpeg exited with 1").await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("ffmpeg exited with 1"));
        assert_eq!(artifact_status(&f).await, ArtifactStatus::Failed);

        let retry_id = f.manager.retry_job(&job_id).await.unwrap();
        assert_ne!(retry_id, job_id);

        let original = f.manager.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(original.status, JobStatus::Failed);
        assert_eq!(original.retry_count, 1);

        let retry = f.manager.get_job(&retry_id).await.unwrap().unwrap();
        assert_eq!(retry.status, JobStatus::Pending);
        assert_eq!(retry.retry_of.as_ref(), Some(&job_id));
        assert_eq!(retry.payload, original.payload);
        assert_eq!(artifact_status(&f).await, ArtifactStatus::Processing(Stage::Mux));

        let current = f.manager.current_job(&f.artifact.id).await.unwrap().unwrap();
        assert_eq!(current.id, retry_id);
        assert_eq!(f.manager.jobs_for_artifact(&f.artifact.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dead_lettered_job_is_not_manually_retried() {
        let f = fixture(StaticEntitlements::new()).await;
        let job_id = f.manager.create_job(mux_payload(&f.artifact)).await.unwrap();
        f.manager.mark_started(&job_id).await.unwrap();
        let failed = f.manager.mark_failed(&job_id, "Failed after 3 attempts: ECONNREFUSED").await.unwrap();

        let record = DeadLetterRecord::from_job(&failed, "Failed after 3 attempts: ECONNREFUSED");
        f.dead_letters.insert(record.clone()).await.unwrap();

        let err = f.manager.retry_job(&job_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState(ref msg) if msg.contains(&record.id)));
        assert_eq!(f.manager.jobs_for_artifact(&f.artifact.id).await.unwrap().len(), 1);
        assert_eq!(f.manager.get_job(&job_id).await.unwrap().unwrap().retry_count, 0);

        // Once the record leaves the active view the job can be retried
        f.dead_letters.take(&record.id).await.unwrap();
        assert!(f.manager.retry_job(&job_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_progress_keeps_fields_written_since_it_read() {
        let f = fixture(StaticEntitlements::new()).await;
        let job_id = f.manager.create_job(mux_payload(&f.artifact)).await.unwrap();
        f.manager.mark_started(&job_id).await.unwrap();

        // A failure is recorded behind the manager's back
        let mut job = f.manager.get_job(&job_id).await.unwrap().unwrap();
        job.attempts = 2;
        job.record_attempt_error(vdub_models::AttemptError::new(
            1,
            "ECONNREFUSED",
            vdub_models::ErrorKind::Transient,
        ));
        assert!(JobRepository::compare_and_swap(f.store.as_ref(), &job, JobStatus::Processing)
            .await
            .unwrap());

        f.manager.update_progress(&job_id, 40, None).await.unwrap();
        let stored = f.manager.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 40);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.error_history.len(), 1);
    }

    #[tokio::test]
    async fn test_review_checkpoints() {
        let f = fixture(StaticEntitlements::new()).await;

        let stt = f
            .manager
            .start_transcription(&f.artifact.id, "s3://in/audio.wav")
            .await
            .unwrap();
        assert!(f
            .manager
            .start_transcription(&f.artifact.id, "s3://in/audio.wav")
            .await
            .is_err());

        assert!(f.manager.confirm_transcript(&f.artifact.id, "tr-1", false).await.is_err());

        f.manager.mark_started(&stt).await.unwrap();
        let outcome = f
            .manager
            .mark_completed(
                &stt,
                Some(StageOutput::Transcribe {
                    transcript_id: "tr-1".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Review { stage: Stage::Transcribe });
        assert_eq!(artifact_status(&f).await, ArtifactStatus::Review(Stage::Transcribe));
        assert_eq!(f.queue.len(Stage::Translate).await.unwrap(), 0);

        assert!(f
            .manager
            .confirm_translation(&f.artifact.id, "tl-1", serde_json::json!({}))
            .await
            .is_err());

        let mt = f.manager.confirm_transcript(&f.artifact.id, "tr-1", true).await.unwrap();
        assert_eq!(f.queue.len(Stage::Translate).await.unwrap(), 1);
        assert_eq!(artifact_status(&f).await, ArtifactStatus::Processing(Stage::Translate));
        assert!(f.manager.confirm_transcript(&f.artifact.id, "tr-1", true).await.is_err());

        let job = f.manager.get_job(&mt).await.unwrap().unwrap();
        match job.payload {
            StagePayload::Translate(p) => {
                assert_eq!(p.transcript_id, "tr-1");
                assert_eq!(p.target_language, "es");
                assert!(p.glossary_enabled);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_synthesis_completion_enqueues_watermarked_mux() {
        let f = fixture(StaticEntitlements::new()).await;
        let job_id = f
            .manager
            .create_job(StagePayload::Synthesize(SynthesizePayload {
                artifact_id: f.artifact.id.clone(),
                user_id: "user-1".into(),
                translation_id: "tl-1".into(),
                voice_config: serde_json::json!({ "voice": "alloy" }),
                target_language: "es".into(),
            }))
            .await
            .unwrap();
        f.manager.mark_started(&job_id).await.unwrap();

        let outcome = f
            .manager
            .mark_completed(
                &job_id,
                Some(StageOutput::Synthesize {
                    audio_url: "s3://dub.wav".into(),
                }),
            )
            .await
            .unwrap();
        let StageOutcome::Advanced { job_id: mux_id, .. } = outcome else {
            panic!("expected advance");
        };
        let mux = f.manager.get_job(&mux_id).await.unwrap().unwrap();
        match mux.payload {
            StagePayload::Mux(p) => {
                assert!(p.apply_watermark);
                assert_eq!(p.audio_url, "s3://dub.wav");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
