//! Failure reports and per-attempt error records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure category used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Network or availability problem, retried with backoff
    Transient,
    /// Explicit non-retryable failure
    Permanent,
    /// Bad input, never retried
    Validation,
    /// Capacity-constrained dependency (GPU, storage), retried with backoff
    Resource,
    /// Stage ran out of time, retried with backoff
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::Permanent => "PERMANENT",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Resource => "RESOURCE",
            ErrorKind::Timeout => "TIMEOUT",
        }
    }

    /// Whether failures of this kind may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::Permanent | ErrorKind::Validation)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by a worker for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StageFailure {
    /// Human-readable error message
    pub message: String,
    /// Explicit category, when the worker knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl StageFailure {
    /// Failure without an explicit category; the classifier decides.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    pub fn with_kind(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind: Some(kind),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::with_kind(message, ErrorKind::Transient)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::with_kind(message, ErrorKind::Permanent)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::with_kind(message, ErrorKind::Validation)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::with_kind(message, ErrorKind::Resource)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_kind(message, ErrorKind::Timeout)
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One entry of a job's failure history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AttemptError {
    /// 1-based attempt number
    pub attempt: u32,
    pub error: String,
    pub kind: ErrorKind,
    pub timestamp: DateTime<Utc>,
}

impl AttemptError {
    pub fn new(attempt: u32, error: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            attempt,
            error: error.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}
