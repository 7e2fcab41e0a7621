//! Shared data models for the VDub dubbing pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Stage jobs and their lifecycle status
//! - Typed per-stage payloads and outputs
//! - Artifacts (dubbing projects) and their pipeline state
//! - The segment ledger ("Context Map") threaded between stages
//! - Failure records and pipeline notification events

pub mod artifact;
pub mod context_map;
pub mod error;
pub mod event;
pub mod failure;
pub mod job;
pub mod payload;

// Re-export common types
pub use artifact::{Artifact, ArtifactId, ArtifactStatus};
pub use context_map::{
    AudioActivity, ContextMap, ContextMapSummary, EmotionTag, Segment, SegmentFailure,
    SegmentPatch, SegmentStatus, Transcript, TranscriptSegment, WordTiming,
};
pub use error::{ModelError, ModelResult};
pub use event::{PipelineEvent, PipelineEventType};
pub use failure::{AttemptError, ErrorKind, StageFailure};
pub use job::{Job, JobId, JobStatus, Stage};
pub use payload::{
    LipSyncPayload, MuxPayload, PayloadError, StageOutput, StagePayload, SynthesizePayload,
    TranscribePayload, TranslatePayload,
};
