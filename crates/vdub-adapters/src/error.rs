//! Adapter error types.

use thiserror::Error;

use vdub_models::{ErrorKind, StageFailure};

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Adapter mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),

    #[error("Model service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Model service returned {status}: {message}")]
    RequestFailed { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    /// Failure category for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Timeout(_) => ErrorKind::Timeout,
            AdapterError::Network(e) if e.is_timeout() => ErrorKind::Timeout,
            AdapterError::Network(_) | AdapterError::ServiceUnavailable(_) => ErrorKind::Transient,
            AdapterError::RequestFailed { status, .. } => match *status {
                408 => ErrorKind::Timeout,
                429 | 500..=599 => ErrorKind::Transient,
                400..=499 => ErrorKind::Validation,
                _ => ErrorKind::Permanent,
            },
            AdapterError::InvalidResponse(_) | AdapterError::Json(_) => ErrorKind::Permanent,
            AdapterError::Mismatch { .. }
            | AdapterError::NotFound(_)
            | AdapterError::InvalidConfig(_)
            | AdapterError::Io(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Report this error as a stage failure with an explicit category.
    pub fn to_stage_failure(&self) -> StageFailure {
        StageFailure::with_kind(self.to_string(), self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = |status| AdapterError::RequestFailed {
            status,
            message: String::new(),
        };
        assert_eq!(err(429).kind(), ErrorKind::Transient);
        assert_eq!(err(503).kind(), ErrorKind::Transient);
        assert_eq!(err(422).kind(), ErrorKind::Validation);
        assert!(!err(400).is_retryable());
        assert_eq!(AdapterError::Timeout(5).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_request_timeout_status_is_retried_as_timeout() {
        let err = AdapterError::RequestFailed {
            status: 408,
            message: "Request Timeout".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_stage_failure_carries_kind() {
        let failure = AdapterError::ServiceUnavailable("down".into()).to_stage_failure();
        assert_eq!(failure.kind, Some(ErrorKind::Transient));
        assert_eq!(failure.message, "Model service unavailable: down");
    }
}
