//! Dead-letter storage for jobs that exhausted their retries.
//!
//! Records are frozen snapshots. The only way out of the active set is
//! [`DeadLetterStore::take`], used by replay, which leaves a copy in the
//! audit log.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use vdub_models::{ArtifactId, AttemptError, Job, JobId, Stage};

use crate::error::{QueueError, QueueResult};

/// Frozen snapshot of a job whose retries ran out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub job: Job,
    pub failure_reason: String,
    pub attempts_made: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub error_history: Vec<AttemptError>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn record_id(stage: Stage, job_id: &JobId) -> String {
        format!("dlq-{}-{}", stage, job_id)
    }

    /// Snapshot `job` with its full error history.
    pub fn from_job(job: &Job, failure_reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Self::record_id(job.stage, &job.id),
            job: job.clone(),
            failure_reason: failure_reason.into(),
            attempts_made: job.attempts,
            first_failed_at: job.error_history.first().map(|e| e.timestamp).unwrap_or(now),
            last_failed_at: job.error_history.last().map(|e| e.timestamp).unwrap_or(now),
            error_history: job.error_history.clone(),
            dead_lettered_at: now,
        }
    }

    pub fn stage(&self) -> Stage {
        self.job.stage
    }
}

/// Audit entry written when a record is replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayAudit {
    pub record: DeadLetterRecord,
    pub new_job_id: JobId,
    pub replayed_at: DateTime<Utc>,
}

impl ReplayAudit {
    pub fn new(record: DeadLetterRecord, new_job_id: JobId) -> Self {
        Self {
            record,
            new_job_id,
            replayed_at: Utc::now(),
        }
    }
}

/// How long records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterRetention {
    pub max_age: Duration,
    pub max_count: usize,
}

impl Default for DeadLetterRetention {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 3600),
            max_count: 1000,
        }
    }
}

impl DeadLetterRetention {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_age: std::env::var("DLQ_MAX_AGE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_age),
            max_count: std::env::var("DLQ_MAX_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_count),
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: u64,
    pub by_stage: BTreeMap<Stage, u64>,
    /// Records replayed so far
    pub replayed: u64,
}

impl DeadLetterStats {
    fn from_records<'a>(records: impl Iterator<Item = &'a DeadLetterRecord>, replayed: u64) -> Self {
        let mut stats = Self {
            replayed,
            ..Self::default()
        };
        for record in records {
            stats.total += 1;
            *stats.by_stage.entry(record.stage()).or_insert(0) += 1;
        }
        stats
    }
}

/// Storage for dead-letter records.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn insert(&self, record: DeadLetterRecord) -> QueueResult<()>;

    async fn get(&self, id: &str) -> QueueResult<Option<DeadLetterRecord>>;

    /// Newest first.
    async fn list_all(&self, limit: usize, offset: usize) -> QueueResult<Vec<DeadLetterRecord>>;

    async fn list_by_user(&self, user_id: &str) -> QueueResult<Vec<DeadLetterRecord>>;

    async fn list_by_artifact(&self, artifact_id: &ArtifactId) -> QueueResult<Vec<DeadLetterRecord>>;

    /// Atomically remove a record from the active set. Only one caller wins.
    async fn take(&self, id: &str) -> QueueResult<DeadLetterRecord>;

    async fn append_audit(&self, audit: ReplayAudit) -> QueueResult<()>;

    /// Newest first.
    async fn audit_log(&self, limit: usize) -> QueueResult<Vec<ReplayAudit>>;

    async fn stats(&self) -> QueueResult<DeadLetterStats>;

    /// Drop records past the retention window; returns how many went.
    async fn purge(&self, retention: &DeadLetterRetention, now: DateTime<Utc>) -> QueueResult<usize>;
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    /// Oldest first
    records: Vec<DeadLetterRecord>,
    audit: Vec<ReplayAudit>,
}

#[derive(Default)]
pub struct MemoryDeadLetterStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn insert(&self, record: DeadLetterRecord) -> QueueResult<()> {
        let mut inner = self.inner.write().await;
        inner.records.retain(|r| r.id != record.id);
        inner.records.push(record);
        Ok(())
    }

    async fn get(&self, id: &str) -> QueueResult<Option<DeadLetterRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.records.iter().find(|r| r.id == id).cloned())
    }

    async fn list_all(&self, limit: usize, offset: usize) -> QueueResult<Vec<DeadLetterRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.records.iter().rev().skip(offset).take(limit).cloned().collect())
    }

    async fn list_by_user(&self, user_id: &str) -> QueueResult<Vec<DeadLetterRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .rev()
            .filter(|r| r.job.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_by_artifact(&self, artifact_id: &ArtifactId) -> QueueResult<Vec<DeadLetterRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .rev()
            .filter(|r| &r.job.artifact_id == artifact_id)
            .cloned()
            .collect())
    }

    async fn take(&self, id: &str) -> QueueResult<DeadLetterRecord> {
        let mut inner = self.inner.write().await;
        let index = inner
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| QueueError::dead_letter_not_found(id))?;
        Ok(inner.records.remove(index))
    }

    async fn append_audit(&self, audit: ReplayAudit) -> QueueResult<()> {
        self.inner.write().await.audit.push(audit);
        Ok(())
    }

    async fn audit_log(&self, limit: usize) -> QueueResult<Vec<ReplayAudit>> {
        let inner = self.inner.read().await;
        Ok(inner.audit.iter().rev().take(limit).cloned().collect())
    }

    async fn stats(&self) -> QueueResult<DeadLetterStats> {
        let inner = self.inner.read().await;
        Ok(DeadLetterStats::from_records(
            inner.records.iter(),
            inner.audit.len() as u64,
        ))
    }

    async fn purge(&self, retention: &DeadLetterRetention, now: DateTime<Utc>) -> QueueResult<usize> {
        let cutoff = retention.cutoff(now);
        let mut inner = self.inner.write().await;
        let before = inner.records.len();

        inner.records.retain(|r| r.dead_lettered_at >= cutoff);
        let overflow = inner.records.len().saturating_sub(retention.max_count);
        inner.records.drain(..overflow);

        Ok(before - inner.records.len())
    }
}

// =============================================================================
// Redis store
// =============================================================================

const TAKE_SCRIPT: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then return false end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return raw
"#;

/// Audit entries kept in Redis.
const AUDIT_LOG_CAP: isize = 10_000;

/// Redis-backed store: a hash of records plus sorted-set indexes scored by
/// dead-letter time.
pub struct RedisDeadLetterStore {
    client: redis::Client,
    prefix: String,
    take: redis::Script,
}

impl RedisDeadLetterStore {
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            take: redis::Script::new(TAKE_SCRIPT),
        })
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    fn records_key(&self) -> String {
        format!("{}:dlq:records", self.prefix)
    }

    fn index_key(&self) -> String {
        format!("{}:dlq:index", self.prefix)
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}:dlq:user:{}", self.prefix, user_id)
    }

    fn artifact_key(&self, artifact_id: &ArtifactId) -> String {
        format!("{}:dlq:artifact:{}", self.prefix, artifact_id)
    }

    fn audit_key(&self) -> String {
        format!("{}:dlq:audit", self.prefix)
    }

    async fn load(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        ids: &[String],
    ) -> QueueResult<Vec<DeadLetterRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.records_key())
            .arg(ids)
            .query_async(conn)
            .await?;

        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(QueueError::from))
            .collect()
    }

    async fn remove(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: &str,
    ) -> QueueResult<Option<DeadLetterRecord>> {
        let raw: Option<String> = self
            .take
            .key(self.records_key())
            .key(self.index_key())
            .arg(id)
            .invoke_async(conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let record: DeadLetterRecord = serde_json::from_str(&raw)?;

        redis::pipe()
            .zrem(self.user_key(&record.job.user_id), id)
            .ignore()
            .zrem(self.artifact_key(&record.job.artifact_id), id)
            .ignore()
            .query_async::<()>(conn)
            .await?;

        Ok(Some(record))
    }
}

#[async_trait]
impl DeadLetterStore for RedisDeadLetterStore {
    async fn insert(&self, record: DeadLetterRecord) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(&record)?;
        let score = record.dead_lettered_at.timestamp_millis();

        redis::pipe()
            .atomic()
            .hset(self.records_key(), &record.id, &json)
            .ignore()
            .zadd(self.index_key(), &record.id, score)
            .ignore()
            .zadd(self.user_key(&record.job.user_id), &record.id, score)
            .ignore()
            .zadd(self.artifact_key(&record.job.artifact_id), &record.id, score)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!(record_id = %record.id, "Stored dead letter record");
        Ok(())
    }

    async fn get(&self, id: &str) -> QueueResult<Option<DeadLetterRecord>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.hget(self.records_key(), id).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(QueueError::from))
            .transpose()
    }

    async fn list_all(&self, limit: usize, offset: usize) -> QueueResult<Vec<DeadLetterRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let start = offset as isize;
        let stop = start + limit as isize - 1;
        let ids: Vec<String> = conn.zrevrange(self.index_key(), start, stop).await?;
        self.load(&mut conn, &ids).await
    }

    async fn list_by_user(&self, user_id: &str) -> QueueResult<Vec<DeadLetterRecord>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.zrevrange(self.user_key(user_id), 0, -1).await?;
        self.load(&mut conn, &ids).await
    }

    async fn list_by_artifact(&self, artifact_id: &ArtifactId) -> QueueResult<Vec<DeadLetterRecord>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.zrevrange(self.artifact_key(artifact_id), 0, -1).await?;
        self.load(&mut conn, &ids).await
    }

    async fn take(&self, id: &str) -> QueueResult<DeadLetterRecord> {
        let mut conn = self.conn().await?;
        self.remove(&mut conn, id)
            .await?
            .ok_or_else(|| QueueError::dead_letter_not_found(id))
    }

    async fn append_audit(&self, audit: ReplayAudit) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(&audit)?;
        redis::pipe()
            .atomic()
            .lpush(self.audit_key(), &json)
            .ignore()
            .ltrim(self.audit_key(), 0, AUDIT_LOG_CAP - 1)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn audit_log(&self, limit: usize) -> QueueResult<Vec<ReplayAudit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.lrange(self.audit_key(), 0, limit as isize - 1).await?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(QueueError::from))
            .collect()
    }

    async fn stats(&self) -> QueueResult<DeadLetterStats> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.hvals(self.records_key()).await?;
        let records = raw
            .iter()
            .map(|json| serde_json::from_str(json).map_err(QueueError::from))
            .collect::<QueueResult<Vec<DeadLetterRecord>>>()?;
        let replayed: u64 = conn.llen(self.audit_key()).await?;
        Ok(DeadLetterStats::from_records(records.iter(), replayed))
    }

    async fn purge(&self, retention: &DeadLetterRetention, now: DateTime<Utc>) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let cutoff = retention.cutoff(now).timestamp_millis();

        // Strictly older than the cutoff
        let mut expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.index_key())
            .arg("-inf")
            .arg(format!("({}", cutoff))
            .query_async(&mut conn)
            .await?;

        let total: usize = conn.zcard(self.index_key()).await?;
        let remaining = total.saturating_sub(expired.len());
        if remaining > retention.max_count {
            let overflow = remaining - retention.max_count;
            let start = expired.len() as isize;
            let oldest: Vec<String> = conn
                .zrange(self.index_key(), start, start + overflow as isize - 1)
                .await?;
            expired.extend(oldest);
        }

        let mut purged = 0;
        for id in &expired {
            if self.remove(&mut conn, id).await?.is_some() {
                purged += 1;
            }
        }

        if purged > 0 {
            info!(purged, "Purged dead letter records");
        }
        Ok(purged)
    }
}
