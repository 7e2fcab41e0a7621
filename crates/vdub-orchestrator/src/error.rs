//! Orchestrator error types.

use thiserror::Error;

use vdub_adapters::AdapterError;
use vdub_models::{ArtifactId, ErrorKind, JobId, ModelError, PayloadError};
use vdub_queue::QueueError;
use vdub_store::StoreError;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(ArtifactId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] PayloadError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Failure category when this error aborts a stage attempt.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Validation(_) => ErrorKind::Validation,
            OrchestratorError::Adapter(e) => e.kind(),
            OrchestratorError::Store(StoreError::ConnectionFailed(_))
            | OrchestratorError::Store(StoreError::Redis(_))
            | OrchestratorError::Queue(_) => ErrorKind::Transient,
            OrchestratorError::JobNotFound(_)
            | OrchestratorError::ArtifactNotFound(_)
            | OrchestratorError::InvalidState(_)
            | OrchestratorError::Config(_)
            | OrchestratorError::Model(_)
            | OrchestratorError::Store(_)
            | OrchestratorError::Json(_) => ErrorKind::Permanent,
        }
    }
}
