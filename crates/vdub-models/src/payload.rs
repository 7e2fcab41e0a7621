//! Typed per-stage job payloads and outputs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::ArtifactId;
use crate::job::Stage;

/// A required payload field was missing or empty.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Missing {field} for {stage} job")]
pub struct PayloadError {
    pub stage: Stage,
    pub field: &'static str,
}

fn require(stage: Stage, field: &'static str, value: &str) -> Result<(), PayloadError> {
    if value.trim().is_empty() {
        Err(PayloadError { stage, field })
    } else {
        Ok(())
    }
}

/// Input for the transcription stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TranscribePayload {
    pub artifact_id: ArtifactId,
    pub user_id: String,
    /// Extracted audio track
    pub audio_url: String,
    pub source_language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
}

/// Input for the translation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TranslatePayload {
    pub artifact_id: ArtifactId,
    pub user_id: String,
    /// Confirmed transcript
    pub transcript_id: String,
    pub source_language: String,
    pub target_language: String,
    #[serde(default)]
    pub glossary_enabled: bool,
}

/// Input for the speech synthesis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SynthesizePayload {
    pub artifact_id: ArtifactId,
    pub user_id: String,
    /// Confirmed translation
    pub translation_id: String,
    /// Voice selection, opaque to the orchestrator
    pub voice_config: serde_json::Value,
    pub target_language: String,
}

/// Input for the muxing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MuxPayload {
    pub artifact_id: ArtifactId,
    pub user_id: String,
    pub video_url: String,
    /// Synthesized dub track
    pub audio_url: String,
    #[serde(default)]
    pub apply_watermark: bool,
}

/// Input for the lip-sync stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LipSyncPayload {
    pub artifact_id: ArtifactId,
    pub user_id: String,
    /// Muxed video
    pub video_url: String,
    pub audio_url: String,
}

/// Stage input, one variant per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StagePayload {
    Transcribe(TranscribePayload),
    Translate(TranslatePayload),
    Synthesize(SynthesizePayload),
    Mux(MuxPayload),
    #[serde(rename = "lipsync")]
    LipSync(LipSyncPayload),
}

impl StagePayload {
    pub fn stage(&self) -> Stage {
        match self {
            StagePayload::Transcribe(_) => Stage::Transcribe,
            StagePayload::Translate(_) => Stage::Translate,
            StagePayload::Synthesize(_) => Stage::Synthesize,
            StagePayload::Mux(_) => Stage::Mux,
            StagePayload::LipSync(_) => Stage::LipSync,
        }
    }

    pub fn artifact_id(&self) -> &ArtifactId {
        match self {
            StagePayload::Transcribe(p) => &p.artifact_id,
            StagePayload::Translate(p) => &p.artifact_id,
            StagePayload::Synthesize(p) => &p.artifact_id,
            StagePayload::Mux(p) => &p.artifact_id,
            StagePayload::LipSync(p) => &p.artifact_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            StagePayload::Transcribe(p) => &p.user_id,
            StagePayload::Translate(p) => &p.user_id,
            StagePayload::Synthesize(p) => &p.user_id,
            StagePayload::Mux(p) => &p.user_id,
            StagePayload::LipSync(p) => &p.user_id,
        }
    }

    /// Check that every required field is present.
    pub fn validate(&self) -> Result<(), PayloadError> {
        let stage = self.stage();
        require(stage, "artifact_id", self.artifact_id().as_str())?;
        require(stage, "user_id", self.user_id())?;

        match self {
            StagePayload::Transcribe(p) => {
                require(stage, "audio_url", &p.audio_url)?;
                require(stage, "source_language", &p.source_language)
            }
            StagePayload::Translate(p) => {
                require(stage, "transcript_id", &p.transcript_id)?;
                require(stage, "target_language", &p.target_language)
            }
            StagePayload::Synthesize(p) => {
                require(stage, "translation_id", &p.translation_id)?;
                if p.voice_config.is_null() {
                    return Err(PayloadError {
                        stage,
                        field: "voice_config",
                    });
                }
                Ok(())
            }
            StagePayload::Mux(p) => {
                require(stage, "video_url", &p.video_url)?;
                require(stage, "audio_url", &p.audio_url)
            }
            StagePayload::LipSync(p) => {
                require(stage, "video_url", &p.video_url)?;
                require(stage, "audio_url", &p.audio_url)
            }
        }
    }
}

/// Addresses produced by a completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageOutput {
    Transcribe {
        transcript_id: String,
    },
    Translate {
        translation_id: String,
    },
    Synthesize {
        audio_url: String,
    },
    Mux {
        video_url: String,
        audio_url: String,
    },
    #[serde(rename = "lipsync")]
    LipSync {
        video_url: String,
    },
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Transcribe { .. } => Stage::Transcribe,
            StageOutput::Translate { .. } => Stage::Translate,
            StageOutput::Synthesize { .. } => Stage::Synthesize,
            StageOutput::Mux { .. } => Stage::Mux,
            StageOutput::LipSync { .. } => Stage::LipSync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux(video_url: &str, audio_url: &str) -> StagePayload {
        StagePayload::Mux(MuxPayload {
            artifact_id: ArtifactId::from_string("a1"),
            user_id: "u1".into(),
            video_url: video_url.into(),
            audio_url: audio_url.into(),
            apply_watermark: false,
        })
    }

    #[test]
    fn test_validate_reports_missing_field() {
        assert!(mux("v.mp4", "a.wav").validate().is_ok());

        let err = mux("v.mp4", "  ").validate().unwrap_err();
        assert_eq!(err.field, "audio_url");
        assert_eq!(err.stage, Stage::Mux);
        assert_eq!(err.to_string(), "Missing audio_url for mux job");
    }

    #[test]
    fn test_synthesize_requires_voice_config() {
        let payload = StagePayload::Synthesize(SynthesizePayload {
            artifact_id: ArtifactId::from_string("a1"),
            user_id: "u1".into(),
            translation_id: "t1".into(),
            voice_config: serde_json::Value::Null,
            target_language: "es".into(),
        });
        assert_eq!(payload.validate().unwrap_err().field, "voice_config");
    }

    #[test]
    fn test_payload_is_tagged_by_stage() {
        let json = serde_json::to_value(mux("v.mp4", "a.wav")).unwrap();
        assert_eq!(json["stage"], "mux");
        let back: StagePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.stage(), Stage::Mux);
    }
}
