//! Stage job definitions.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::artifact::ArtifactId;
use crate::error::{ModelError, ModelResult};
use crate::failure::AttemptError;
use crate::payload::{StageOutput, StagePayload};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One step of the fixed dubbing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Speech-to-text
    Transcribe,
    /// Machine translation
    Translate,
    /// Speech synthesis
    Synthesize,
    /// Audio/video muxing
    Mux,
    /// Lip-sync video generation
    #[serde(rename = "lipsync")]
    LipSync,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::Transcribe,
        Stage::Translate,
        Stage::Synthesize,
        Stage::Mux,
        Stage::LipSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Transcribe => "transcribe",
            Stage::Translate => "translate",
            Stage::Synthesize => "synthesize",
            Stage::Mux => "mux",
            Stage::LipSync => "lipsync",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "transcribe" | "stt" => Ok(Stage::Transcribe),
            "translate" | "mt" => Ok(Stage::Translate),
            "synthesize" | "tts" => Ok(Stage::Synthesize),
            "mux" | "muxing" => Ok(Stage::Mux),
            "lipsync" | "lip_sync" => Ok(Stage::LipSync),
            other => Err(ModelError::UnknownStage(other.to_string())),
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Persisted and enqueued, not yet picked up
    #[default]
    Pending,
    /// Claimed by a worker
    Processing,
    /// Finished successfully
    Completed,
    /// Finished with a terminal failure
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Only PENDING -> PROCESSING -> {COMPLETED, FAILED} is legal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single run of one artifact through one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Artifact being processed
    pub artifact_id: ArtifactId,

    /// Owner of the artifact
    pub user_id: String,

    /// Pipeline stage
    pub stage: Stage,

    /// Lifecycle status
    #[serde(default)]
    pub status: JobStatus,

    /// Progress (0-100)
    #[serde(default)]
    pub progress: u8,

    /// Delivery attempts made so far
    #[serde(default)]
    pub attempts: u32,

    /// Manual retries spawned from this job
    #[serde(default)]
    pub retry_count: u32,

    /// Stage input
    pub payload: StagePayload,

    /// Stage output, set on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StageOutput>,

    /// Free-form progress metadata reported by the worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_metadata: Option<serde_json::Value>,

    /// Last error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Every failed attempt, oldest first
    #[serde(default)]
    pub error_history: Vec<AttemptError>,

    /// Job whose completion auto-enqueued this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<JobId>,

    /// Job this one was retried or replayed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<JobId>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Started at timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Completed (or failed) at timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Bumped by the store on every write; conditional writes compare it
    #[serde(default)]
    pub revision: u64,
}

impl Job {
    /// Create a new PENDING job for the payload's artifact.
    pub fn new(payload: StagePayload) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            artifact_id: payload.artifact_id().clone(),
            user_id: payload.user_id().to_string(),
            stage: payload.stage(),
            status: JobStatus::Pending,
            progress: 0,
            attempts: 0,
            retry_count: 0,
            payload,
            output: None,
            progress_metadata: None,
            error_message: None,
            error_history: Vec::new(),
            triggered_by: None,
            retry_of: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            revision: 0,
        }
    }

    /// Mark the job as spawned by another job's completion.
    pub fn triggered_by(mut self, job_id: JobId) -> Self {
        self.triggered_by = Some(job_id);
        self
    }

    /// Mark the job as a retry of another job.
    pub fn retry_of(mut self, job_id: JobId) -> Self {
        self.retry_of = Some(job_id);
        self
    }

    fn transition(&mut self, next: JobStatus) -> ModelResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// PENDING -> PROCESSING.
    pub fn start(&mut self) -> ModelResult<()> {
        self.transition(JobStatus::Processing)?;
        self.started_at = Some(self.updated_at);
        self.attempts = self.attempts.max(1);
        Ok(())
    }

    /// PROCESSING -> COMPLETED.
    pub fn complete(&mut self, output: Option<StageOutput>) -> ModelResult<()> {
        self.transition(JobStatus::Completed)?;
        self.progress = 100;
        self.output = output;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// PROCESSING -> FAILED.
    pub fn fail(&mut self, error: impl Into<String>) -> ModelResult<()> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(error.into());
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Set progress, clamping to [0, 100].
    ///
    /// Returns the clamped value when the input had to be corrected.
    pub fn set_progress(&mut self, percent: i32) -> Option<u8> {
        let clamped = percent.clamp(0, 100) as u8;
        self.progress = clamped;
        self.updated_at = Utc::now();
        (clamped as i32 != percent).then_some(clamped)
    }

    /// Append an attempt failure to the history.
    pub fn record_attempt_error(&mut self, error: AttemptError) {
        self.error_message = Some(error.error.clone());
        self.error_history.push(error);
        self.updated_at = Utc::now();
    }
}
