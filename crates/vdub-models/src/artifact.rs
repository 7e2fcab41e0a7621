//! Artifact (dubbing project) models.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::job::Stage;

/// Unique identifier for a media artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ArtifactId(pub String);

impl ArtifactId {
    /// Generate a new random artifact ID.
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

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ArtifactId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Artifact-level pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Uploaded, no stage started
    #[default]
    Draft,
    /// A stage job is queued or running
    Processing(Stage),
    /// Waiting for the owner to confirm the output of a stage
    Review(Stage),
    /// Pipeline finished
    Completed,
    /// Pipeline stopped on a terminal failure
    Failed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Draft => "draft",
            ArtifactStatus::Processing(_) => "processing",
            ArtifactStatus::Review(_) => "review",
            ArtifactStatus::Completed => "completed",
            ArtifactStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ArtifactStatus::Completed | ArtifactStatus::Failed)
    }

    /// Stage awaiting confirmation, if in review.
    pub fn review_stage(&self) -> Option<Stage> {
        match self {
            ArtifactStatus::Review(stage) => Some(*stage),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactStatus::Processing(stage) | ArtifactStatus::Review(stage) => {
                write!(f, "{}({})", self.as_str(), stage)
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

/// A media artifact moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Artifact {
    pub id: ArtifactId,
    /// Owning user
    pub user_id: String,
    /// Source video
    pub video_url: String,
    pub source_language: String,
    pub target_language: String,
    #[serde(default)]
    pub status: ArtifactStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        user_id: impl Into<String>,
        video_url: impl Into<String>,
        source_language: impl Into<String>,
        target_language: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ArtifactId::new(),
            user_id: user_id.into(),
            video_url: video_url.into(),
            source_language: source_language.into(),
            target_language: target_language.into(),
            status: ArtifactStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the status and bump the updated_at timestamp.
    pub fn set_status(&mut self, status: ArtifactStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_review_state_carries_stage() {
        let status = ArtifactStatus::Review(Stage::Translate);
        assert_eq!(status.review_stage(), Some(Stage::Translate));
        assert!(!status.is_terminal());
        assert_eq!(status.to_string(), "review(translate)");

        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["state"], "review");
        assert_eq!(json["stage"], "translate");
    }

    #[test]
    fn test_terminal_states() {
        assert!(ArtifactStatus::Completed.is_terminal());
        assert!(ArtifactStatus::Failed.is_terminal());
        assert!(!ArtifactStatus::Processing(Stage::Mux).is_terminal());
    }
}
