//! In-process store for tests and single-process runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use vdub_models::{
    Artifact, ArtifactId, ArtifactStatus, ContextMap, Job, JobId, JobStatus, Stage,
};

use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::repos::{ArtifactRepository, ContextMapRepository, JobRepository};

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
    by_artifact: HashMap<ArtifactId, Vec<JobId>>,
    /// parent job -> job its completion spawned
    triggered: HashMap<JobId, JobId>,
}

#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<JobTable>,
    artifacts: RwLock<HashMap<ArtifactId, Artifact>>,
    context_maps: RwLock<HashMap<ArtifactId, ContextMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create(&self, job: &Job) -> StoreResult<()> {
        let mut table = self.jobs.write().await;
        if table.jobs.contains_key(&job.id) {
            return Err(StoreError::already_exists(format!("job {}", job.id)));
        }
        if let Some(parent) = &job.triggered_by {
            if table.triggered.contains_key(parent) {
                return Err(StoreError::DuplicateTrigger(parent.clone()));
            }
            table.triggered.insert(parent.clone(), job.id.clone());
        }

        table
            .by_artifact
            .entry(job.artifact_id.clone())
            .or_default()
            .push(job.id.clone());
        table.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> StoreResult<Option<Job>> {
        Ok(self.jobs.read().await.jobs.get(id).cloned())
    }

    async fn update(&self, job: &Job) -> StoreResult<()> {
        let mut table = self.jobs.write().await;
        let slot = table
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::not_found(format!("job {}", job.id)))?;
        *slot = job.clone();
        slot.revision = job.revision + 1;
        Ok(())
    }

    async fn compare_and_swap(&self, job: &Job, expected: JobStatus) -> StoreResult<bool> {
        let mut table = self.jobs.write().await;
        let slot = table
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::not_found(format!("job {}", job.id)))?;

        let applied = slot.status == expected && slot.revision == job.revision;
        if applied {
            *slot = job.clone();
            slot.revision = job.revision + 1;
        }
        metrics::record_cas("job", applied);
        Ok(applied)
    }

    async fn list_by_artifact(&self, artifact_id: &ArtifactId) -> StoreResult<Vec<Job>> {
        let table = self.jobs.read().await;
        Ok(table
            .by_artifact
            .get(artifact_id)
            .map(|ids| ids.iter().filter_map(|id| table.jobs.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn list_by_status(&self, status: JobStatus, stage: Option<Stage>) -> StoreResult<Vec<Job>> {
        let table = self.jobs.read().await;
        let mut jobs: Vec<Job> = table
            .jobs
            .values()
            .filter(|j| j.status == status && stage.map_or(true, |s| j.stage == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn find_triggered_by(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        let table = self.jobs.read().await;
        Ok(table
            .triggered
            .get(job_id)
            .and_then(|child| table.jobs.get(child).cloned()))
    }
}

#[async_trait]
impl ArtifactRepository for MemoryStore {
    async fn create(&self, artifact: &Artifact) -> StoreResult<()> {
        let mut artifacts = self.artifacts.write().await;
        if artifacts.contains_key(&artifact.id) {
            return Err(StoreError::already_exists(format!("artifact {}", artifact.id)));
        }
        artifacts.insert(artifact.id.clone(), artifact.clone());
        Ok(())
    }

    async fn get(&self, id: &ArtifactId) -> StoreResult<Option<Artifact>> {
        Ok(self.artifacts.read().await.get(id).cloned())
    }

    async fn set_status(&self, id: &ArtifactId, status: ArtifactStatus) -> StoreResult<Artifact> {
        let mut artifacts = self.artifacts.write().await;
        let artifact = artifacts
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(format!("artifact {}", id)))?;
        artifact.set_status(status);
        Ok(artifact.clone())
    }

    async fn compare_and_set_status(
        &self,
        id: &ArtifactId,
        expected: ArtifactStatus,
        next: ArtifactStatus,
    ) -> StoreResult<bool> {
        let mut artifacts = self.artifacts.write().await;
        let artifact = artifacts
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(format!("artifact {}", id)))?;

        let applied = artifact.status == expected;
        if applied {
            artifact.set_status(next);
        }
        metrics::record_cas("artifact", applied);
        Ok(applied)
    }
}

#[async_trait]
impl ContextMapRepository for MemoryStore {
    async fn get(&self, artifact_id: &ArtifactId) -> StoreResult<Option<ContextMap>> {
        Ok(self.context_maps.read().await.get(artifact_id).cloned())
    }

    async fn put(&self, map: &ContextMap) -> StoreResult<()> {
        map.validate()?;
        let mut map = map.clone();
        map.updated_at = Utc::now();
        self.context_maps
            .write()
            .await
            .insert(map.artifact_id.clone(), map);
        Ok(())
    }

    async fn compare_and_swap(&self, map: &ContextMap, expected_version: u64) -> StoreResult<bool> {
        map.validate()?;
        let mut maps = self.context_maps.write().await;
        let slot = maps
            .get_mut(&map.artifact_id)
            .ok_or_else(|| StoreError::not_found(format!("context map {}", map.artifact_id)))?;

        if slot.version != expected_version {
            return Ok(false);
        }
        *slot = map.clone();
        Ok(true)
    }

    async fn delete(&self, artifact_id: &ArtifactId) -> StoreResult<()> {
        self.context_maps.write().await.remove(artifact_id);
        Ok(())
    }
}
