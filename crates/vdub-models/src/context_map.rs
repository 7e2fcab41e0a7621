//! Segment ledger ("Context Map") threaded through every stage.
//!
//! One map exists per artifact. Transcription creates it, and each later
//! stage fills in its own per-segment fields through [`SegmentPatch`]es.
//! Segments stay ordered by start time and never overlap; any patch that
//! would break that is rejected and leaves the map untouched.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactId;
use crate::error::{ModelError, ModelResult};

/// Word-level timing from the transcriber (seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub confidence: f32,
}

/// Transcriber segment (seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TranscriptSegment {
    pub id: u32,
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub speaker: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub words: Vec<WordTiming>,
}

/// Transcriber output used to seed a context map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Transcript {
    pub segments: Vec<TranscriptSegment>,
    /// Total duration in seconds
    pub duration: f64,
}

/// Detected speech activity window (leading/trailing silence trimmed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AudioActivity {
    /// Offset where speech begins
    pub start_ms: u64,
    /// Offset where speech ends
    pub end_ms: u64,
    /// Duration of the untrimmed source
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EmotionTag {
    Neutral,
    Happy,
    Sad,
    Angry,
    Excited,
    Fearful,
    Surprised,
    Disgusted,
}

/// Why a segment failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SegmentFailure {
    Adaptation,
    Synthesis,
    VocalIsolation,
    Other(String),
}

/// Per-segment outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SegmentStatus {
    #[default]
    Pending,
    Success,
    Failed(SegmentFailure),
}

impl SegmentStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, SegmentStatus::Failed(_))
    }
}

/// One line of dialogue and everything the stages know about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Segment {
    /// Stable across stages
    pub id: u32,
    pub start_ms: u64,
    pub end_ms: u64,
    /// Duration in seconds
    pub duration: f64,
    pub text: String,
    pub speaker: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_line: Option<String>,

    // Vocal isolation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_audio_path: Option<String>,

    // Emotion analysis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<EmotionTag>,

    // Translation / adaptation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapted_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_feedback: Option<String>,

    // Synthesis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_audio_path: Option<String>,

    #[serde(default)]
    pub status: SegmentStatus,
    #[serde(default)]
    pub attempts: u32,
}

impl Segment {
    fn duration_secs(start_ms: u64, end_ms: u64) -> f64 {
        end_ms.saturating_sub(start_ms) as f64 / 1000.0
    }
}

/// A stage-scoped update to one segment.
///
/// Each variant touches only the fields owned by the stage that emits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentPatch {
    /// Transcript review: new timing
    Retime { start_ms: u64, end_ms: u64 },
    /// Transcript review: corrected text
    Reword { text: String },
    /// Vocal isolation output
    CleanAudio { path: String },
    /// Emotion analysis output
    Emotion { tag: EmotionTag },
    /// Translation output
    Adaptation {
        text: String,
        status: SegmentStatus,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
    /// Synthesis output
    GeneratedAudio { path: String },
    /// A stage gave up on this segment
    Failure { failure: SegmentFailure },
}

/// Aggregate segment outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContextMapSummary {
    pub total_segments: usize,
    pub successful_segments: usize,
    pub failed_segments: usize,
    pub pending_segments: usize,
    pub average_attempts: f64,
    /// Percentage of successful segments
    pub completion_rate: f64,
}

/// Per-artifact segment ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContextMap {
    pub artifact_id: ArtifactId,
    pub source_language: String,
    pub target_language: String,
    pub original_duration_ms: u64,
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_activity: Option<AudioActivity>,
    /// Bumped on every committed update
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContextMap {
    /// Build a map from transcriber output.
    ///
    /// Word timings, when present, override the coarser segment bounds.
    /// Every offset is shifted by the detected speech start so timings
    /// line up with the untrimmed source.
    pub fn from_transcript(
        artifact_id: ArtifactId,
        transcript: &Transcript,
        source_language: impl Into<String>,
        target_language: impl Into<String>,
        audio_activity: Option<AudioActivity>,
    ) -> ModelResult<Self> {
        let offset = audio_activity.map(|a| a.start_ms).unwrap_or(0);
        let src = &transcript.segments;

        let segments = src
            .iter()
            .enumerate()
            .map(|(index, seg)| {
                let (start_ms, end_ms) = match (seg.words.first(), seg.words.last()) {
                    (Some(first), Some(last)) => (secs_to_ms(first.start), secs_to_ms(last.end)),
                    _ => (secs_to_ms(seg.start), secs_to_ms(seg.end)),
                };
                let start_ms = start_ms + offset;
                let end_ms = end_ms + offset;

                Segment {
                    id: seg.id,
                    start_ms,
                    end_ms,
                    duration: Segment::duration_secs(start_ms, end_ms),
                    text: seg.text.clone(),
                    speaker: seg.speaker.clone(),
                    confidence: seg.confidence,
                    previous_line: index.checked_sub(1).map(|i| src[i].text.clone()),
                    next_line: src.get(index + 1).map(|s| s.text.clone()),
                    clean_audio_path: None,
                    emotion: None,
                    adapted_text: None,
                    validation_feedback: None,
                    generated_audio_path: None,
                    status: SegmentStatus::Pending,
                    attempts: 0,
                }
            })
            .collect();

        let now = Utc::now();
        let map = Self {
            artifact_id,
            source_language: source_language.into(),
            target_language: target_language.into(),
            original_duration_ms: audio_activity
                .map(|a| a.total_duration_ms)
                .unwrap_or_else(|| secs_to_ms(transcript.duration)),
            segments,
            audio_activity,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        map.validate()?;
        Ok(map)
    }

    pub fn segment(&self, id: u32) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id == id)
    }

    /// List every structural problem with the map.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.artifact_id.as_str().is_empty() {
            errors.push("Missing artifact_id".to_string());
        }
        if self.original_duration_ms == 0 {
            errors.push("Invalid original_duration_ms".to_string());
        }

        for (index, segment) in self.segments.iter().enumerate() {
            if segment.end_ms <= segment.start_ms {
                errors.push(format!(
                    "Segment {} (id {}): end_ms must be greater than start_ms",
                    index, segment.id
                ));
            }
            if segment.text.trim().is_empty() {
                errors.push(format!("Segment {} (id {}): Missing text", index, segment.id));
            }
            if segment.speaker.trim().is_empty() {
                errors.push(format!("Segment {} (id {}): Missing speaker", index, segment.id));
            }
        }

        for (index, pair) in self.segments.windows(2).enumerate() {
            let (current, next) = (&pair[0], &pair[1]);
            if next.start_ms < current.start_ms {
                errors.push(format!("Segments {} and {} are out of order", index, index + 1));
            }
            if current.end_ms > next.start_ms {
                errors.push(format!("Segments {} and {} overlap", index, index + 1));
            }
        }

        errors
    }

    pub fn validate(&self) -> ModelResult<()> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::invalid_context_map(errors))
        }
    }

    /// Apply one patch. See [`ContextMap::apply_patches`].
    pub fn apply_patch(&mut self, segment_id: u32, patch: SegmentPatch) -> ModelResult<()> {
        self.apply_patches(vec![(segment_id, patch)])
    }

    /// Apply a batch of patches atomically.
    ///
    /// The result is validated as a whole; on any error the map is left
    /// exactly as it was.
    pub fn apply_patches(&mut self, patches: Vec<(u32, SegmentPatch)>) -> ModelResult<()> {
        let mut candidate = self.segments.clone();

        for (segment_id, patch) in patches {
            let index = candidate
                .iter()
                .position(|s| s.id == segment_id)
                .ok_or(ModelError::SegmentNotFound(segment_id))?;

            let mut segment = candidate[index].clone();
            let reworded = apply_to_segment(&mut segment, patch);
            candidate[index] = segment;

            if let Some(text) = reworded {
                if index > 0 {
                    candidate[index - 1].next_line = Some(text.clone());
                }
                if let Some(next) = candidate.get_mut(index + 1) {
                    next.previous_line = Some(text);
                }
            }
        }

        let previous = std::mem::replace(&mut self.segments, candidate);
        if let Err(e) = self.validate() {
            self.segments = previous;
            return Err(e);
        }

        self.version += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn summary(&self) -> ContextMapSummary {
        let total = self.segments.len();
        let successful = self
            .segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Success)
            .count();
        let failed = self.segments.iter().filter(|s| s.status.is_failed()).count();
        let pending = self
            .segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Pending)
            .count();
        let attempts: u64 = self.segments.iter().map(|s| s.attempts as u64).sum();

        let (average_attempts, completion_rate) = if total > 0 {
            (
                attempts as f64 / total as f64,
                successful as f64 / total as f64 * 100.0,
            )
        } else {
            (0.0, 0.0)
        };

        ContextMapSummary {
            total_segments: total,
            successful_segments: successful,
            failed_segments: failed,
            pending_segments: pending,
            average_attempts,
            completion_rate,
        }
    }
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs.max(0.0) * 1000.0).round() as u64
}

/// Returns the new text when the patch rewords the segment.
fn apply_to_segment(segment: &mut Segment, patch: SegmentPatch) -> Option<String> {
    match patch {
        SegmentPatch::Retime { start_ms, end_ms } => {
            segment.start_ms = start_ms;
            segment.end_ms = end_ms;
            segment.duration = Segment::duration_secs(start_ms, end_ms);
        }
        SegmentPatch::Reword { text } => {
            segment.text = text.clone();
            return Some(text);
        }
        SegmentPatch::CleanAudio { path } => segment.clean_audio_path = Some(path),
        SegmentPatch::Emotion { tag } => segment.emotion = Some(tag),
        SegmentPatch::Adaptation {
            text,
            status,
            attempts,
            feedback,
        } => {
            segment.adapted_text = Some(text);
            segment.status = status;
            segment.attempts = attempts;
            segment.validation_feedback = feedback;
        }
        SegmentPatch::GeneratedAudio { path } => {
            segment.generated_audio_path = Some(path);
            segment.status = SegmentStatus::Success;
        }
        SegmentPatch::Failure { failure } => {
            segment.status = SegmentStatus::Failed(failure);
            segment.attempts += 1;
        }
    }
    None
}
