//! Queue entries and deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vdub_models::{ArtifactId, Job, JobId, Stage, StagePayload};

/// Work item placed on a stage queue. The job id is the correlation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub job_id: JobId,
    pub artifact_id: ArtifactId,
    pub user_id: String,
    pub stage: Stage,
    /// 1-based attempt this delivery represents
    pub attempt: u32,
    pub payload: StagePayload,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEnvelope {
    /// First-attempt envelope for a job.
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            artifact_id: job.artifact_id.clone(),
            user_id: job.user_id.clone(),
            stage: job.stage,
            attempt: 1,
            payload: job.payload.clone(),
            enqueued_at: Utc::now(),
        }
    }

    /// Envelope for the given retry attempt.
    pub fn retry(&self, attempt: u32) -> Self {
        Self {
            attempt,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// An envelope handed to a consumer. Must be acked once handled.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Backend-specific id used for ack
    pub delivery_id: String,
    pub consumer: String,
    pub envelope: QueueEnvelope,
    /// How many times this entry has been handed out, including this one
    pub delivery_count: u32,
}

impl Delivery {
    /// Whether this is a redelivery after a stalled consumer.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
