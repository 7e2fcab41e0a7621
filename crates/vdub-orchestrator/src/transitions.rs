//! Stage transition table.
//!
//! What happens to an artifact when a stage job completes is decided here
//! and only here. Transcription and translation stop at a human review
//! checkpoint; later stages advance on their own.

use serde::{Deserialize, Serialize};

use vdub_models::{
    Artifact, Job, JobId, LipSyncPayload, MuxPayload, Stage, StageOutput, StagePayload,
};

use crate::entitlement::Capability;
use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Artifact waits in REVIEW until the owner confirms this stage.
    Review(Stage),
    /// Enqueue `next` automatically.
    Advance(Stage),
    /// Enqueue `next` when the owner has `capability`, otherwise complete.
    AdvanceIfEntitled { next: Stage, capability: Capability },
    /// Artifact is done.
    Complete,
}

/// Transition per completed stage, in pipeline order.
pub const TRANSITIONS: [(Stage, Transition); 5] = [
    (Stage::Transcribe, Transition::Review(Stage::Transcribe)),
    (Stage::Translate, Transition::Review(Stage::Translate)),
    (Stage::Synthesize, Transition::Advance(Stage::Mux)),
    (
        Stage::Mux,
        Transition::AdvanceIfEntitled {
            next: Stage::LipSync,
            capability: Capability::LipSync,
        },
    ),
    (Stage::LipSync, Transition::Complete),
];

pub fn transition_for(stage: Stage) -> Transition {
    TRANSITIONS
        .iter()
        .find(|(s, _)| *s == stage)
        .map(|(_, t)| *t)
        .unwrap_or(Transition::Complete)
}

/// Stages whose output feeds an automatic next stage.
pub fn requires_output(stage: Stage) -> bool {
    matches!(stage, Stage::Synthesize | Stage::Mux)
}

/// Result of completing a stage job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The job was already completed; nothing ran.
    AlreadyCompleted,
    Review { stage: Stage },
    Advanced { stage: Stage, job_id: JobId },
    ArtifactCompleted,
}

/// Build the payload for the job that follows `completed`.
pub fn next_payload(
    next: Stage,
    artifact: &Artifact,
    completed: &Job,
    apply_watermark: bool,
) -> OrchestratorResult<StagePayload> {
    let missing = || {
        OrchestratorError::invalid_state(format!(
            "{} job {} completed without the output {} needs",
            completed.stage, completed.id, next
        ))
    };

    match (next, completed.output.as_ref()) {
        (Stage::Mux, Some(StageOutput::Synthesize { audio_url })) => Ok(StagePayload::Mux(MuxPayload {
            artifact_id: artifact.id.clone(),
            user_id: artifact.user_id.clone(),
            video_url: artifact.video_url.clone(),
            audio_url: audio_url.clone(),
            apply_watermark,
        })),
        (Stage::LipSync, Some(StageOutput::Mux { video_url, audio_url })) => {
            Ok(StagePayload::LipSync(LipSyncPayload {
                artifact_id: artifact.id.clone(),
                user_id: artifact.user_id.clone(),
                video_url: video_url.clone(),
                audio_url: audio_url.clone(),
            }))
        }
        (Stage::Mux | Stage::LipSync, _) => Err(missing()),
        (other, _) => Err(OrchestratorError::invalid_state(format!(
            "{other} is never started automatically"
        ))),
    }
}
