//! Model validation errors.

use thiserror::Error;

use crate::job::{JobStatus, Stage};

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Invalid context map: {}", .0.join("; "))]
    InvalidContextMap(Vec<String>),

    #[error("Segment {0} not found in context map")]
    SegmentNotFound(u32),

    #[error("Payload stage mismatch: expected {expected}, got {actual}")]
    StageMismatch { expected: Stage, actual: Stage },

    #[error("Unknown stage: {0}")]
    UnknownStage(String),
}

impl ModelError {
    pub fn invalid_context_map(errors: Vec<String>) -> Self {
        Self::InvalidContextMap(errors)
    }
}
