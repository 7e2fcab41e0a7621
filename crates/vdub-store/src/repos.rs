//! Repository contracts.

use async_trait::async_trait;
use tracing::debug;

use vdub_models::{
    Artifact, ArtifactId, ArtifactStatus, ContextMap, Job, JobId, JobStatus, SegmentPatch, Stage,
};

use crate::error::{StoreError, StoreResult};
use crate::metrics;

/// Optimistic retries for a context map read-modify-write.
const PATCH_MAX_RETRIES: u32 = 5;

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job.
    ///
    /// Fails with [`StoreError::DuplicateTrigger`] when `job.triggered_by`
    /// already spawned another job, so a completion auto-advances once.
    async fn create(&self, job: &Job) -> StoreResult<()>;

    async fn get(&self, id: &JobId) -> StoreResult<Option<Job>>;

    /// Overwrite the whole record (last writer wins). The stored revision
    /// becomes `job.revision + 1`.
    async fn update(&self, job: &Job) -> StoreResult<()>;

    /// Overwrite the record only if its stored status is `expected` and its
    /// stored revision is still `job.revision`, i.e. nobody wrote the job
    /// since it was read. The stored revision becomes `job.revision + 1`.
    ///
    /// Returns `false` on either mismatch.
    async fn compare_and_swap(&self, job: &Job, expected: JobStatus) -> StoreResult<bool>;

    /// Jobs of an artifact in creation order.
    async fn list_by_artifact(&self, artifact_id: &ArtifactId) -> StoreResult<Vec<Job>>;

    async fn list_by_status(&self, status: JobStatus, stage: Option<Stage>) -> StoreResult<Vec<Job>>;

    /// The job spawned by `job_id`'s completion, if any.
    async fn find_triggered_by(&self, job_id: &JobId) -> StoreResult<Option<Job>>;
}

#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    async fn create(&self, artifact: &Artifact) -> StoreResult<()>;

    async fn get(&self, id: &ArtifactId) -> StoreResult<Option<Artifact>>;

    /// Set the status unconditionally; returns the updated artifact.
    async fn set_status(&self, id: &ArtifactId, status: ArtifactStatus) -> StoreResult<Artifact>;

    /// Set the status only if the current one is `expected`.
    async fn compare_and_set_status(
        &self,
        id: &ArtifactId,
        expected: ArtifactStatus,
        next: ArtifactStatus,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait ContextMapRepository: Send + Sync {
    async fn get(&self, artifact_id: &ArtifactId) -> StoreResult<Option<ContextMap>>;

    /// Write the whole document (last writer wins).
    async fn put(&self, map: &ContextMap) -> StoreResult<()>;

    /// Write the document only if the stored version is `expected_version`.
    async fn compare_and_swap(&self, map: &ContextMap, expected_version: u64) -> StoreResult<bool>;

    async fn delete(&self, artifact_id: &ArtifactId) -> StoreResult<()>;

    /// Apply segment patches with optimistic concurrency.
    ///
    /// Re-reads and reapplies on version conflicts. Patches that would make
    /// the map invalid are rejected without writing.
    async fn patch(
        &self,
        artifact_id: &ArtifactId,
        patches: Vec<(u32, SegmentPatch)>,
    ) -> StoreResult<ContextMap> {
        for attempt in 1..=PATCH_MAX_RETRIES {
            let mut map = self
                .get(artifact_id)
                .await?
                .ok_or_else(|| StoreError::not_found(format!("context map {}", artifact_id)))?;
            let expected = map.version;

            map.apply_patches(patches.clone())?;

            if self.compare_and_swap(&map, expected).await? {
                metrics::record_cas("context_map", true);
                return Ok(map);
            }

            metrics::record_cas("context_map", false);
            debug!(
                artifact_id = %artifact_id,
                attempt,
                "Context map version conflict, retrying"
            );
        }

        Err(StoreError::precondition_failed(format!(
            "context map {} changed concurrently {} times",
            artifact_id, PATCH_MAX_RETRIES
        )))
    }
}
