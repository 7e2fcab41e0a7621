//! Redis-backed store.
//!
//! Records are JSON strings. Conditional writes run as Lua scripts so the
//! check and the write happen in one step on the server.

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tracing::debug;

use vdub_models::{
    Artifact, ArtifactId, ArtifactStatus, ContextMap, Job, JobId, JobStatus, Stage,
};

use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::repos::{ArtifactRepository, ContextMapRepository, JobRepository};

/// KEYS: job, artifact job list, status set, trigger guard.
/// ARGV: job json, job id, has trigger ("1"/"0").
/// Returns 1 created, 0 id taken, -1 trigger already used.
const CREATE_JOB_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
if ARGV[3] == '1' then
  if redis.call('SETNX', KEYS[4], ARGV[2]) == 0 then return -1 end
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('RPUSH', KEYS[2], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[2])
return 1
"#;

/// KEYS: job. ARGV: job json (revision already bumped), expected status
/// ('' for any), status set prefix, expected revision ('' for any).
/// Returns 1 written, 0 status or revision mismatch, -1 missing.
const WRITE_JOB_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return -1 end
local current = cjson.decode(raw)
if ARGV[2] ~= '' and current['status'] ~= ARGV[2] then return 0 end
if ARGV[4] ~= '' and tonumber(current['revision'] or 0) ~= tonumber(ARGV[4]) then return 0 end
local nextjob = cjson.decode(ARGV[1])
redis.call('SET', KEYS[1], ARGV[1])
if current['status'] ~= nextjob['status'] then
  redis.call('SREM', ARGV[3] .. current['status'], nextjob['id'])
  redis.call('SADD', ARGV[3] .. nextjob['status'], nextjob['id'])
end
return 1
"#;

/// KEYS: artifact. ARGV: expected state, expected stage ('' for none), artifact json.
const CAS_ARTIFACT_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return -1 end
local status = cjson.decode(raw)['status']
local stage = status['stage']
if type(stage) ~= 'string' then stage = '' end
if status['state'] ~= ARGV[1] or stage ~= ARGV[2] then return 0 end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

/// KEYS: context map. ARGV: expected version, map json.
const CAS_CONTEXT_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return -1 end
local version = cjson.decode(raw)['version'] or 0
if tonumber(version) ~= tonumber(ARGV[1]) then return 0 end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

/// State and stage strings as they appear in the stored JSON.
fn status_parts(status: ArtifactStatus) -> (&'static str, &'static str) {
    let stage = match status {
        ArtifactStatus::Processing(stage) | ArtifactStatus::Review(stage) => stage.as_str(),
        _ => "",
    };
    (status.as_str(), stage)
}

pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    create_job: redis::Script,
    write_job: redis::Script,
    cas_artifact: redis::Script,
    cas_context: redis::Script,
}

impl RedisStore {
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            create_job: redis::Script::new(CREATE_JOB_SCRIPT),
            write_job: redis::Script::new(WRITE_JOB_SCRIPT),
            cas_artifact: redis::Script::new(CAS_ARTIFACT_SCRIPT),
            cas_context: redis::Script::new(CAS_CONTEXT_SCRIPT),
        })
    }

    async fn conn(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn artifact_jobs_key(&self, id: &ArtifactId) -> String {
        format!("{}:artifact:{}:jobs", self.prefix, id)
    }

    fn status_set_prefix(&self) -> String {
        format!("{}:jobs:status:", self.prefix)
    }

    fn trigger_key(&self, parent: &JobId) -> String {
        format!("{}:job:{}:triggered", self.prefix, parent)
    }

    fn artifact_key(&self, id: &ArtifactId) -> String {
        format!("{}:artifact:{}", self.prefix, id)
    }

    fn context_key(&self, id: &ArtifactId) -> String {
        format!("{}:context:{}", self.prefix, id)
    }

    /// With `expected` set, the write only lands if the stored status and
    /// revision still match `job`.
    async fn write_job(&self, job: &Job, expected: Option<JobStatus>) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let mut next = job.clone();
        next.revision = job.revision + 1;
        let json = serde_json::to_string(&next)?;
        let expected_revision = if expected.is_some() {
            job.revision.to_string()
        } else {
            String::new()
        };
        let result: i64 = self
            .write_job
            .key(self.job_key(&job.id))
            .arg(json)
            .arg(expected.map(|s| s.as_str()).unwrap_or(""))
            .arg(self.status_set_prefix())
            .arg(expected_revision)
            .invoke_async(&mut conn)
            .await?;

        match result {
            -1 => Err(StoreError::not_found(format!("job {}", job.id))),
            n => Ok(n == 1),
        }
    }

    async fn load_jobs(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        ids: &[String],
    ) -> StoreResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}:job:{}", self.prefix, id))
            .collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(conn).await?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl JobRepository for RedisStore {
    async fn create(&self, job: &Job) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(job)?;
        let trigger_key = job
            .triggered_by
            .as_ref()
            .map(|parent| self.trigger_key(parent))
            .unwrap_or_else(|| self.job_key(&job.id));

        let result: i64 = self
            .create_job
            .key(self.job_key(&job.id))
            .key(self.artifact_jobs_key(&job.artifact_id))
            .key(format!("{}{}", self.status_set_prefix(), job.status))
            .key(trigger_key)
            .arg(json)
            .arg(job.id.as_str())
            .arg(if job.triggered_by.is_some() { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        match result {
            1 => {
                debug!(job_id = %job.id, stage = %job.stage, "Stored job");
                Ok(())
            }
            0 => Err(StoreError::already_exists(format!("job {}", job.id))),
            _ => Err(StoreError::DuplicateTrigger(
                job.triggered_by.clone().unwrap_or_else(|| job.id.clone()),
            )),
        }
    }

    async fn get(&self, id: &JobId) -> StoreResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.job_key(id)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn update(&self, job: &Job) -> StoreResult<()> {
        self.write_job(job, None).await.map(|_| ())
    }

    async fn compare_and_swap(&self, job: &Job, expected: JobStatus) -> StoreResult<bool> {
        let applied = self.write_job(job, Some(expected)).await?;
        metrics::record_cas("job", applied);
        Ok(applied)
    }

    async fn list_by_artifact(&self, artifact_id: &ArtifactId) -> StoreResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.lrange(self.artifact_jobs_key(artifact_id), 0, -1).await?;
        self.load_jobs(&mut conn, &ids).await
    }

    async fn list_by_status(&self, status: JobStatus, stage: Option<Stage>) -> StoreResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .smembers(format!("{}{}", self.status_set_prefix(), status))
            .await?;
        let mut jobs: Vec<Job> = self
            .load_jobs(&mut conn, &ids)
            .await?
            .into_iter()
            .filter(|j| j.status == status && stage.map_or(true, |s| j.stage == s))
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn find_triggered_by(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let child: Option<String> = conn.get(self.trigger_key(job_id)).await?;
        match child {
            Some(child) => JobRepository::get(self, &JobId::from_string(child)).await,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ArtifactRepository for RedisStore {
    async fn create(&self, artifact: &Artifact) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(artifact)?;
        let created: bool = conn.set_nx(self.artifact_key(&artifact.id), json).await?;
        if !created {
            return Err(StoreError::already_exists(format!("artifact {}", artifact.id)));
        }
        Ok(())
    }

    async fn get(&self, id: &ArtifactId) -> StoreResult<Option<Artifact>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.artifact_key(id)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn set_status(&self, id: &ArtifactId, status: ArtifactStatus) -> StoreResult<Artifact> {
        let mut artifact = ArtifactRepository::get(self, id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("artifact {}", id)))?;
        artifact.set_status(status);

        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(self.artifact_key(id), serde_json::to_string(&artifact)?)
            .await?;
        Ok(artifact)
    }

    async fn compare_and_set_status(
        &self,
        id: &ArtifactId,
        expected: ArtifactStatus,
        next: ArtifactStatus,
    ) -> StoreResult<bool> {
        let mut artifact = ArtifactRepository::get(self, id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("artifact {}", id)))?;
        artifact.set_status(next);

        let (state, stage) = status_parts(expected);
        let mut conn = self.conn().await?;
        let result: i64 = self
            .cas_artifact
            .key(self.artifact_key(id))
            .arg(state)
            .arg(stage)
            .arg(serde_json::to_string(&artifact)?)
            .invoke_async(&mut conn)
            .await?;

        match result {
            -1 => Err(StoreError::not_found(format!("artifact {}", id))),
            n => {
                metrics::record_cas("artifact", n == 1);
                Ok(n == 1)
            }
        }
    }
}

#[async_trait]
impl ContextMapRepository for RedisStore {
    async fn get(&self, artifact_id: &ArtifactId) -> StoreResult<Option<ContextMap>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.context_key(artifact_id)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn put(&self, map: &ContextMap) -> StoreResult<()> {
        map.validate()?;
        let mut map = map.clone();
        map.updated_at = Utc::now();

        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(self.context_key(&map.artifact_id), serde_json::to_string(&map)?)
            .await?;
        Ok(())
    }

    async fn compare_and_swap(&self, map: &ContextMap, expected_version: u64) -> StoreResult<bool> {
        map.validate()?;
        let mut conn = self.conn().await?;
        let result: i64 = self
            .cas_context
            .key(self.context_key(&map.artifact_id))
            .arg(expected_version)
            .arg(serde_json::to_string(map)?)
            .invoke_async(&mut conn)
            .await?;

        match result {
            -1 => Err(StoreError::not_found(format!("context map {}", map.artifact_id))),
            n => Ok(n == 1),
        }
    }

    async fn delete(&self, artifact_id: &ArtifactId) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.context_key(artifact_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdub_models::{StagePayload, TranslatePayload};

    fn store() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        RedisStore::new(&url, format!("vdub-test-{}", uuid::Uuid::new_v4())).unwrap()
    }

    fn job() -> Job {
        Job::new(StagePayload::Translate(TranslatePayload {
            artifact_id: ArtifactId::from_string("a1"),
            user_id: "u1".into(),
            transcript_id: "tr1".into(),
            source_language: "en".into(),
            target_language: "es".into(),
            glossary_enabled: false,
        }))
    }

    #[test]
    fn test_status_parts() {
        assert_eq!(status_parts(ArtifactStatus::Review(Stage::Translate)), ("review", "translate"));
        assert_eq!(status_parts(ArtifactStatus::Completed), ("completed", ""));
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_job_lifecycle() {
        let store = store();
        let mut job = job();
        JobRepository::create(&store, &job).await.unwrap();
        assert!(JobRepository::create(&store, &job).await.is_err());

        job.start().unwrap();
        assert!(JobRepository::compare_and_swap(&store, &job, JobStatus::Pending).await.unwrap());
        assert!(!JobRepository::compare_and_swap(&store, &job, JobStatus::Pending).await.unwrap());

        // Same status, stale revision
        let mut stale = job.clone();
        let mut fresh = JobRepository::get(&store, &job.id).await.unwrap().unwrap();
        assert_eq!(fresh.revision, 1);
        fresh.set_progress(20);
        assert!(JobRepository::compare_and_swap(&store, &fresh, JobStatus::Processing).await.unwrap());
        stale.set_progress(90);
        assert!(!JobRepository::compare_and_swap(&store, &stale, JobStatus::Processing).await.unwrap());
        assert_eq!(JobRepository::get(&store, &job.id).await.unwrap().unwrap().progress, 20);

        let processing = store.list_by_status(JobStatus::Processing, None).await.unwrap();
        assert_eq!(processing.len(), 1);
        assert!(store.list_by_status(JobStatus::Pending, None).await.unwrap().is_empty());

        let child = self::job().triggered_by(job.id.clone());
        JobRepository::create(&store, &child).await.unwrap();
        let again = self::job().triggered_by(job.id.clone());
        assert!(matches!(
            JobRepository::create(&store, &again).await,
            Err(StoreError::DuplicateTrigger(_))
        ));
        assert_eq!(store.find_triggered_by(&job.id).await.unwrap().unwrap().id, child.id);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_artifact_cas() {
        let store = store();
        let artifact = Artifact::new("u1", "v.mp4", "en", "es");
        ArtifactRepository::create(&store, &artifact).await.unwrap();

        let review = ArtifactStatus::Review(Stage::Transcribe);
        store.set_status(&artifact.id, review).await.unwrap();
        let next = ArtifactStatus::Processing(Stage::Translate);
        assert!(store.compare_and_set_status(&artifact.id, review, next).await.unwrap());
        assert!(!store.compare_and_set_status(&artifact.id, review, next).await.unwrap());
    }
}
