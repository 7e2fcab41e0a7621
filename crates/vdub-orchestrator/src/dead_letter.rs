//! Dead letter queue service.
//!
//! Records are written before the owner hears that a job is unrecoverable.
//! Replay takes the record out of the active view, submits a fresh job from
//! the frozen payload and appends the pair to the audit log.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use vdub_models::{ArtifactId, Job, JobId, PipelineEvent};
use vdub_queue::{
    DeadLetterRecord, DeadLetterRetention, DeadLetterStats, DeadLetterStore, ReplayAudit,
};

use crate::error::OrchestratorResult;
use crate::job_manager::JobManager;
use crate::metrics;
use crate::notifier::Notifier;

pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
    job_manager: Arc<JobManager>,
    notifier: Notifier,
    retention: DeadLetterRetention,
}

impl DeadLetterQueue {
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        job_manager: Arc<JobManager>,
        notifier: Notifier,
        retention: DeadLetterRetention,
    ) -> Self {
        Self {
            store,
            job_manager,
            notifier,
            retention,
        }
    }

    /// Freeze `job` with its error history.
    pub async fn move_to_dead_letter(
        &self,
        job: &Job,
        failure_reason: &str,
    ) -> OrchestratorResult<DeadLetterRecord> {
        let record = DeadLetterRecord::from_job(job, failure_reason);
        self.store.insert(record.clone()).await?;

        error!(
            job_id = %job.id,
            artifact_id = %job.artifact_id,
            stage = %job.stage,
            record_id = %record.id,
            attempts = record.attempts_made,
            "Job moved to dead letter queue: {}", failure_reason
        );
        metrics::record_dead_lettered(job.stage);
        self.notifier.send_to_user(
            &job.user_id,
            PipelineEvent::JobMovedToDeadLetter {
                artifact_id: job.artifact_id.clone(),
                job_id: job.id.clone(),
                stage: job.stage,
                record_id: record.id.clone(),
                message: format!(
                    "Job failed after {} attempts and needs manual action",
                    record.attempts_made
                ),
            },
        );
        Ok(record)
    }

    pub async fn get(&self, record_id: &str) -> OrchestratorResult<Option<DeadLetterRecord>> {
        Ok(self.store.get(record_id).await?)
    }

    /// Newest first.
    pub async fn list_all(&self, limit: usize, offset: usize) -> OrchestratorResult<Vec<DeadLetterRecord>> {
        Ok(self.store.list_all(limit, offset).await?)
    }

    pub async fn list_by_user(&self, user_id: &str) -> OrchestratorResult<Vec<DeadLetterRecord>> {
        Ok(self.store.list_by_user(user_id).await?)
    }

    pub async fn list_by_artifact(&self, artifact_id: &ArtifactId) -> OrchestratorResult<Vec<DeadLetterRecord>> {
        Ok(self.store.list_by_artifact(artifact_id).await?)
    }

    /// Submit a new job from the record's frozen payload.
    pub async fn replay(&self, record_id: &str) -> OrchestratorResult<JobId> {
        let record = self.store.take(record_id).await?;

        let new_job_id = match self.job_manager.resubmit(&record.job).await {
            Ok(id) => id,
            Err(e) => {
                warn!(record_id, error = %e, "Replay failed, restoring dead letter record");
                if let Err(restore) = self.store.insert(record).await {
                    error!(record_id, error = %restore, "Failed to restore dead letter record");
                }
                return Err(e);
            }
        };

        let stage = record.stage();
        self.store
            .append_audit(ReplayAudit::new(record, new_job_id.clone()))
            .await?;

        info!(record_id, new_job_id = %new_job_id, stage = %stage, "Replayed dead letter record");
        metrics::record_replay(stage);
        Ok(new_job_id)
    }

    pub async fn audit_log(&self, limit: usize) -> OrchestratorResult<Vec<ReplayAudit>> {
        Ok(self.store.audit_log(limit).await?)
    }

    pub async fn stats(&self) -> OrchestratorResult<DeadLetterStats> {
        Ok(self.store.stats().await?)
    }

    /// Drop records outside the retention window.
    pub async fn purge(&self) -> OrchestratorResult<usize> {
        let purged = self.store.purge(&self.retention, Utc::now()).await?;
        if purged > 0 {
            info!(purged, "Purged dead letter records");
            metrics::record_purged(purged);
        }
        Ok(purged)
    }

    /// Run [`purge`](Self::purge) every `interval` until shutdown.
    pub fn spawn_purge_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.purge().await {
                            warn!(error = %e, "Dead letter purge failed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::StaticEntitlements;
    use crate::notifier::outbox;
    use vdub_models::{
        Artifact, AttemptError, ErrorKind, JobStatus, PipelineEventType, Stage, StagePayload,
        TranscribePayload,
    };
    use vdub_queue::{MemoryDeadLetterStore, MemoryQueue, QueueBackend};
    use vdub_store::{ArtifactRepository, JobRepository, MemoryStore};

    async fn setup() -> (DeadLetterQueue, Arc<MemoryStore>, Arc<MemoryQueue>, Job, crate::notifier::Outbox) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::default());
        let (notifier, outbox) = outbox(64);
        let dlq_store = Arc::new(MemoryDeadLetterStore::new());
        let manager = Arc::new(JobManager::new(
            store.clone(),
            store.clone(),
            queue.clone(),
            dlq_store.clone(),
            Arc::new(StaticEntitlements::new()),
            notifier.clone(),
        ));
        let dlq = DeadLetterQueue::new(
            dlq_store,
            manager,
            notifier,
            DeadLetterRetention::default(),
        );

        let artifact = Artifact::new("u1", "v.mp4", "en", "es");
        ArtifactRepository::create(store.as_ref(), &artifact).await.unwrap();

        let mut job = Job::new(StagePayload::Transcribe(TranscribePayload {
            artifact_id: artifact.id.clone(),
            user_id: "u1".into(),
            audio_url: "a.wav".into(),
            source_language: "en".into(),
            target_language: None,
        }));
        job.start().unwrap();
        for attempt in 1..=3 {
            job.record_attempt_error(AttemptError::new(attempt, "ECONNREFUSED", ErrorKind::Transient));
        }
        job.attempts = 3;
        job.fail("retries exhausted").unwrap();
        JobRepository::create(store.as_ref(), &job).await.unwrap();

        (dlq, store, queue, job, outbox)
    }

    #[tokio::test]
    async fn test_move_and_project() {
        let (dlq, _store, _queue, job, mut outbox) = setup().await;
        let record = dlq.move_to_dead_letter(&job, "retries exhausted").await.unwrap();

        assert_eq!(record.error_history.len(), 3);
        assert_eq!(record.attempts_made, 3);
        assert_eq!(dlq.list_by_user("u1").await.unwrap().len(), 1);
        assert_eq!(dlq.list_by_artifact(&job.artifact_id).await.unwrap().len(), 1);
        assert_eq!(dlq.stats().await.unwrap().by_stage.get(&Stage::Transcribe), Some(&1));

        let events = outbox.drain_pending();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.event_type(), PipelineEventType::JobMovedToDeadLetter);
    }

    #[tokio::test]
    async fn test_replay_creates_new_job_and_keeps_audit() {
        let (dlq, store, queue, job, _outbox) = setup().await;
        let record = dlq.move_to_dead_letter(&job, "retries exhausted").await.unwrap();

        let new_id = dlq.replay(&record.id).await.unwrap();
        assert_ne!(new_id, job.id);

        let replayed = JobRepository::get(store.as_ref(), &new_id).await.unwrap().unwrap();
        assert_eq!(replayed.status, JobStatus::Pending);
        assert_eq!(replayed.retry_of.as_ref(), Some(&job.id));
        assert_eq!(replayed.payload, job.payload);
        assert_eq!(queue.len(Stage::Transcribe).await.unwrap(), 1);

        // Original job untouched
        let original = JobRepository::get(store.as_ref(), &job.id).await.unwrap().unwrap();
        assert_eq!(original.status, JobStatus::Failed);

        assert!(dlq.get(&record.id).await.unwrap().is_none());
        assert!(dlq.replay(&record.id).await.is_err());

        let audit = dlq.audit_log(10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].new_job_id, new_id);
        assert_eq!(audit[0].record, record);
    }

    #[tokio::test]
    async fn test_failed_replay_restores_record() {
        let (dlq, store, _queue, mut job, _outbox) = setup().await;
        // Point the frozen job at an artifact that no longer exists
        job.artifact_id = vdub_models::ArtifactId::from_string("gone");
        if let StagePayload::Transcribe(p) = &mut job.payload {
            p.artifact_id = job.artifact_id.clone();
        }
        JobRepository::update(store.as_ref(), &job).await.unwrap();
        let record = dlq.move_to_dead_letter(&job, "retries exhausted").await.unwrap();

        assert!(dlq.replay(&record.id).await.is_err());
        assert!(dlq.get(&record.id).await.unwrap().is_some());
        assert!(dlq.audit_log(10).await.unwrap().is_empty());
    }
}
