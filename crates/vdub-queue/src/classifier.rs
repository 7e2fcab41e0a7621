//! Failure classification.
//!
//! Workers report a [`StageFailure`]; an explicit kind always wins. Failures
//! without one are matched against known message signatures, and anything
//! unrecognized is treated as transient so it gets the full retry budget.

use serde::{Deserialize, Serialize};
use tracing::debug;

use vdub_models::{ErrorKind, Stage, StageFailure};

const TRANSIENT_SIGNATURES: &[&str] = &[
    "econnrefused",
    "connection refused",
    "connection reset",
    "etimedout",
    "enotfound",
    "network",
    "temporarily unavailable",
    "service unavailable",
    "too many requests",
    "rate limit",
];

const VALIDATION_SIGNATURES: &[&str] = &[
    "missing ",
    "required field",
    "is required",
    "invalid input",
    "invalid payload",
    "validation failed",
];

const TIMEOUT_SIGNATURES: &[&str] = &["timeout", "timed out", "deadline exceeded"];

const RESOURCE_SIGNATURES: &[&str] = &[
    "out of memory",
    "oom-kill",
    "oomkilled",
    "oom killer",
    "gpu unavailable",
    "no gpu",
    "no space left",
    "capacity",
    "quota exceeded",
];

/// Outcome of classifying one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl Classification {
    pub fn of(kind: ErrorKind) -> Self {
        Self {
            kind,
            retryable: kind.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a failure reported for `stage` on attempt `attempt`.
    ///
    /// The attempt count does not change the category; the retry policy
    /// applies the ceiling.
    pub fn classify(&self, failure: &StageFailure, stage: Stage, attempt: u32) -> Classification {
        let kind = failure
            .kind
            .unwrap_or_else(|| Self::kind_from_message(&failure.message));
        let classification = Classification::of(kind);

        debug!(
            stage = %stage,
            attempt,
            kind = %classification.kind,
            retryable = classification.retryable,
            "Classified stage failure"
        );

        classification
    }

    /// Match a bare error message against known signatures.
    pub fn kind_from_message(message: &str) -> ErrorKind {
        let lower = message.to_lowercase();
        let matches = |signatures: &[&str]| signatures.iter().any(|s| lower.contains(s));

        if matches(TRANSIENT_SIGNATURES) {
            ErrorKind::Transient
        } else if matches(VALIDATION_SIGNATURES) {
            ErrorKind::Validation
        } else if matches(TIMEOUT_SIGNATURES) {
            ErrorKind::Timeout
        } else if matches(RESOURCE_SIGNATURES) {
            ErrorKind::Resource
        } else {
            ErrorKind::Transient
        }
    }
}
