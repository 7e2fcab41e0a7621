//! Context map access for stage workers.

use std::sync::Arc;

use tracing::info;

use vdub_models::{
    ArtifactId, AudioActivity, ContextMap, ContextMapSummary, SegmentPatch, Transcript,
};
use vdub_store::{ArtifactRepository, ContextMapRepository};

use crate::error::{OrchestratorError, OrchestratorResult};

pub struct SegmentLedger {
    maps: Arc<dyn ContextMapRepository>,
    artifacts: Arc<dyn ArtifactRepository>,
}

impl SegmentLedger {
    pub fn new(maps: Arc<dyn ContextMapRepository>, artifacts: Arc<dyn ArtifactRepository>) -> Self {
        Self { maps, artifacts }
    }

    /// Seed (or reseed) an artifact's map from transcriber output.
    pub async fn initialize(
        &self,
        artifact_id: &ArtifactId,
        transcript: &Transcript,
        audio_activity: Option<AudioActivity>,
    ) -> OrchestratorResult<ContextMap> {
        let artifact = self
            .artifacts
            .get(artifact_id)
            .await?
            .ok_or_else(|| OrchestratorError::ArtifactNotFound(artifact_id.clone()))?;

        let mut map = ContextMap::from_transcript(
            artifact.id.clone(),
            transcript,
            artifact.source_language.clone(),
            artifact.target_language.clone(),
            audio_activity,
        )?;

        if let Some(previous) = self.maps.get(artifact_id).await? {
            map.version = previous.version + 1;
        }
        self.maps.put(&map).await?;

        info!(
            artifact_id = %artifact_id,
            segments = map.segments.len(),
            duration_ms = map.original_duration_ms,
            "Context map initialized"
        );
        Ok(map)
    }

    pub async fn get(&self, artifact_id: &ArtifactId) -> OrchestratorResult<Option<ContextMap>> {
        Ok(self.maps.get(artifact_id).await?)
    }

    /// Apply stage patches atomically. An invalid result is rejected whole.
    pub async fn patch(
        &self,
        artifact_id: &ArtifactId,
        patches: Vec<(u32, SegmentPatch)>,
    ) -> OrchestratorResult<ContextMap> {
        Ok(self.maps.patch(artifact_id, patches).await?)
    }

    pub async fn summary(&self, artifact_id: &ArtifactId) -> OrchestratorResult<Option<ContextMapSummary>> {
        Ok(self.maps.get(artifact_id).await?.map(|m| m.summary()))
    }

    pub async fn delete(&self, artifact_id: &ArtifactId) -> OrchestratorResult<()> {
        Ok(self.maps.delete(artifact_id).await?)
    }
}
