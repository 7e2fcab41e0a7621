//! Pipeline lifecycle notifications pushed to artifact owners.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactId;
use crate::job::{JobId, Stage};

/// Notification event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventType {
    JobCreated,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobRetrying,
    JobMovedToDeadLetter,
    StageReadyForReview,
    ArtifactCompleted,
}

impl PipelineEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineEventType::JobCreated => "job_created",
            PipelineEventType::JobStarted => "job_started",
            PipelineEventType::JobProgress => "job_progress",
            PipelineEventType::JobCompleted => "job_completed",
            PipelineEventType::JobFailed => "job_failed",
            PipelineEventType::JobRetrying => "job_retrying",
            PipelineEventType::JobMovedToDeadLetter => "job_moved_to_dead_letter",
            PipelineEventType::StageReadyForReview => "stage_ready_for_review",
            PipelineEventType::ArtifactCompleted => "artifact_completed",
        }
    }
}

/// Notification envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobCreated {
        #[serde(rename = "artifactId")]
        artifact_id: ArtifactId,
        #[serde(rename = "jobId")]
        job_id: JobId,
        stage: Stage,
    },

    JobStarted {
        #[serde(rename = "artifactId")]
        artifact_id: ArtifactId,
        #[serde(rename = "jobId")]
        job_id: JobId,
        stage: Stage,
    },

    /// Progress update (0-100)
    JobProgress {
        #[serde(rename = "artifactId")]
        artifact_id: ArtifactId,
        #[serde(rename = "jobId")]
        job_id: JobId,
        stage: Stage,
        progress: u8,
    },

    JobCompleted {
        #[serde(rename = "artifactId")]
        artifact_id: ArtifactId,
        #[serde(rename = "jobId")]
        job_id: JobId,
        stage: Stage,
    },

    JobFailed {
        #[serde(rename = "artifactId")]
        artifact_id: ArtifactId,
        #[serde(rename = "jobId")]
        job_id: JobId,
        stage: Stage,
        error: String,
    },

    /// A transient failure will be retried after a delay
    JobRetrying {
        #[serde(rename = "artifactId")]
        artifact_id: ArtifactId,
        #[serde(rename = "jobId")]
        job_id: JobId,
        stage: Stage,
        attempt: u32,
        #[serde(rename = "maxAttempts")]
        max_attempts: u32,
        #[serde(rename = "nextRetryInMs")]
        next_retry_in_ms: u64,
    },

    /// Retries exhausted; manual action required
    JobMovedToDeadLetter {
        #[serde(rename = "artifactId")]
        artifact_id: ArtifactId,
        #[serde(rename = "jobId")]
        job_id: JobId,
        stage: Stage,
        #[serde(rename = "recordId")]
        record_id: String,
        message: String,
    },

    StageReadyForReview {
        #[serde(rename = "artifactId")]
        artifact_id: ArtifactId,
        stage: Stage,
        message: String,
    },

    ArtifactCompleted {
        #[serde(rename = "artifactId")]
        artifact_id: ArtifactId,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn event_type(&self) -> PipelineEventType {
        match self {
            PipelineEvent::JobCreated { .. } => PipelineEventType::JobCreated,
            PipelineEvent::JobStarted { .. } => PipelineEventType::JobStarted,
            PipelineEvent::JobProgress { .. } => PipelineEventType::JobProgress,
            PipelineEvent::JobCompleted { .. } => PipelineEventType::JobCompleted,
            PipelineEvent::JobFailed { .. } => PipelineEventType::JobFailed,
            PipelineEvent::JobRetrying { .. } => PipelineEventType::JobRetrying,
            PipelineEvent::JobMovedToDeadLetter { .. } => PipelineEventType::JobMovedToDeadLetter,
            PipelineEvent::StageReadyForReview { .. } => PipelineEventType::StageReadyForReview,
            PipelineEvent::ArtifactCompleted { .. } => PipelineEventType::ArtifactCompleted,
        }
    }

    pub fn artifact_id(&self) -> &ArtifactId {
        match self {
            PipelineEvent::JobCreated { artifact_id, .. }
            | PipelineEvent::JobStarted { artifact_id, .. }
            | PipelineEvent::JobProgress { artifact_id, .. }
            | PipelineEvent::JobCompleted { artifact_id, .. }
            | PipelineEvent::JobFailed { artifact_id, .. }
            | PipelineEvent::JobRetrying { artifact_id, .. }
            | PipelineEvent::JobMovedToDeadLetter { artifact_id, .. }
            | PipelineEvent::StageReadyForReview { artifact_id, .. }
            | PipelineEvent::ArtifactCompleted { artifact_id, .. } => artifact_id,
        }
    }

    pub fn artifact_completed(artifact_id: ArtifactId, message: impl Into<String>) -> Self {
        Self::ArtifactCompleted {
            artifact_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn ready_for_review(artifact_id: ArtifactId, stage: Stage) -> Self {
        let message = match stage {
            Stage::Transcribe => "Transcript is ready for review",
            Stage::Translate => "Translation is ready for review",
            _ => "Stage output is ready for review",
        };
        Self::StageReadyForReview {
            artifact_id,
            stage,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = PipelineEvent::JobRetrying {
            artifact_id: ArtifactId::from_string("a1"),
            job_id: JobId::from_string("j1"),
            stage: Stage::Synthesize,
            attempt: 1,
            max_attempts: 3,
            next_retry_in_ms: 5000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_retrying");
        assert_eq!(json["artifactId"], "a1");
        assert_eq!(json["nextRetryInMs"], 5000);
        assert_eq!(event.event_type().as_str(), "job_retrying");
    }

    #[test]
    fn test_review_messages() {
        let event = PipelineEvent::ready_for_review(ArtifactId::from_string("a1"), Stage::Transcribe);
        match event {
            PipelineEvent::StageReadyForReview { message, .. } => {
                assert_eq!(message, "Transcript is ready for review")
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
