//! Per-stage job queues on Redis Streams.
//!
//! Each stage has its own stream and consumer group. Retries wait in a
//! per-stage sorted set scored by due time and are moved onto the stream by
//! a Lua script, so promotion is atomic across consumers.

use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use vdub_models::Stage;

use crate::backend::QueueBackend;
use crate::envelope::{Delivery, QueueEnvelope};
use crate::error::{QueueError, QueueResult};

const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  redis.call('XADD', KEYS[2], '*', 'job', member)
end
return #due
"#;

/// Resets the idle time of a pending entry if `consumer` still holds the
/// same delivery of it. JUSTID leaves the delivery counter alone.
const EXTEND_SCRIPT: &str = r#"
local pending = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[3], ARGV[3], 1, ARGV[2])
if #pending == 0 then
  return 0
end
if tonumber(pending[1][4]) ~= tonumber(ARGV[4]) then
  return 0
end
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[2], 0, ARGV[3], 'JUSTID')
return 1
"#;

/// Max delayed entries promoted per claim call.
const PROMOTE_BATCH: usize = 100;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix for every key
    pub key_prefix: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Deliveries held longer than this are handed to another consumer
    pub visibility_timeout: Duration,
    /// How long a claim blocks waiting for new entries
    pub block_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vdub".to_string(),
            consumer_group: "vdub:workers".to_string(),
            visibility_timeout: Duration::from_secs(600), // 10 minutes
            block_timeout: Duration::from_millis(1000),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            visibility_timeout: Duration::from_secs(
                std::env::var("QUEUE_VISIBILITY_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            block_timeout: Duration::from_millis(
                std::env::var("QUEUE_BLOCK_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
        }
    }

    pub fn stream_key(&self, stage: Stage) -> String {
        format!("{}:queue:{}", self.key_prefix, stage)
    }

    pub fn delayed_key(&self, stage: Stage) -> String {
        format!("{}:queue:{}:delayed", self.key_prefix, stage)
    }

    pub fn paused_key(&self, stage: Stage) -> String {
        format!("{}:queue:{}:paused", self.key_prefix, stage)
    }

    /// Sorted set of acked entry ids scored by ack time.
    pub fn finished_key(&self, stage: Stage) -> String {
        format!("{}:queue:{}:finished", self.key_prefix, stage)
    }
}

/// Redis Streams queue backend.
pub struct RedisQueue {
    client: redis::Client,
    config: QueueConfig,
    promote: redis::Script,
    extend: redis::Script,
}

impl RedisQueue {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            promote: redis::Script::new(PROMOTE_DUE_SCRIPT),
            extend: redis::Script::new(EXTEND_SCRIPT),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    /// Create the consumer group on every stage stream (idempotent).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        for stage in Stage::ALL {
            let stream = self.config.stream_key(stage);
            let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&stream)
                .arg(&self.config.consumer_group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match result {
                Ok(_) => info!(stream = %stream, "Created consumer group: {}", self.config.consumer_group),
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!(stream = %stream, "Consumer group already exists");
                }
                Err(e) => return Err(QueueError::Redis(e)),
            }
        }

        Ok(())
    }

    async fn promote_due(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        stage: Stage,
    ) -> QueueResult<u64> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let promoted: u64 = self
            .promote
            .key(self.config.delayed_key(stage))
            .key(self.config.stream_key(stage))
            .arg(now_ms)
            .arg(PROMOTE_BATCH)
            .invoke_async(conn)
            .await?;

        if promoted > 0 {
            debug!(stage = %stage, promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Take over entries other consumers have held past the visibility timeout.
    async fn reclaim_stalled(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        stage: Stage,
        consumer: &str,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let stream = self.config.stream_key(stage);
        let min_idle_ms = self.config.visibility_timeout.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            cmd.arg(&entry.id);
        }

        // XCLAIM re-checks idle time, so an entry grabbed by another
        // consumer in between is skipped.
        let claimed: StreamClaimReply = cmd.query_async(conn).await?;

        let mut deliveries = Vec::new();
        for entry in claimed.ids {
            let times_delivered = pending
                .ids
                .iter()
                .find(|p| p.id == entry.id)
                .map(|p| p.times_delivered as u32)
                .unwrap_or(1);

            if let Some(delivery) = self
                .decode(conn, stage, consumer, entry, times_delivered + 1)
                .await?
            {
                info!(
                    stage = %stage,
                    job_id = %delivery.envelope.job_id,
                    delivery_count = delivery.delivery_count,
                    "Reclaimed stalled job"
                );
                deliveries.push(delivery);
            }
        }

        Ok(deliveries)
    }

    async fn decode(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        stage: Stage,
        consumer: &str,
        entry: StreamId,
        delivery_count: u32,
    ) -> QueueResult<Option<Delivery>> {
        let payload: Option<String> = entry.get("job");
        let parsed = payload
            .as_deref()
            .map(serde_json::from_str::<QueueEnvelope>);

        match parsed {
            Some(Ok(envelope)) => Ok(Some(Delivery {
                delivery_id: entry.id,
                consumer: consumer.to_string(),
                envelope,
                delivery_count,
            })),
            Some(Err(e)) => {
                warn!(stage = %stage, entry_id = %entry.id, "Failed to parse job payload: {}", e);
                self.remove_entry(conn, stage, &entry.id).await?;
                Ok(None)
            }
            None => {
                warn!(stage = %stage, entry_id = %entry.id, "Stream entry has no job field");
                self.remove_entry(conn, stage, &entry.id).await?;
                Ok(None)
            }
        }
    }

    async fn remove_entry(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        stage: Stage,
        entry_id: &str,
    ) -> QueueResult<()> {
        let stream = self.config.stream_key(stage);
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&stream)
            .arg(entry_id)
            .ignore()
            .query_async::<()>(conn)
            .await?;
        Ok(())
    }

    async fn pending_count(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        stage: Stage,
    ) -> QueueResult<u64> {
        let pending: StreamPendingReply = redis::cmd("XPENDING")
            .arg(self.config.stream_key(stage))
            .arg(&self.config.consumer_group)
            .query_async(conn)
            .await?;
        Ok(pending.count() as u64)
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn enqueue(&self, envelope: QueueEnvelope) -> QueueResult<String> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&envelope)?;

        let message_id: String = redis::cmd("XADD")
            .arg(self.config.stream_key(envelope.stage))
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("job_id")
            .arg(envelope.job_id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;

        info!(
            stage = %envelope.stage,
            job_id = %envelope.job_id,
            attempt = envelope.attempt,
            "Enqueued job with message ID {}",
            message_id
        );

        Ok(message_id)
    }

    async fn enqueue_delayed(&self, envelope: QueueEnvelope, delay: Duration) -> QueueResult<String> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&envelope)?;
        let due_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;

        conn.zadd::<_, _, _, ()>(self.config.delayed_key(envelope.stage), &payload, due_ms)
            .await?;

        info!(
            stage = %envelope.stage,
            job_id = %envelope.job_id,
            attempt = envelope.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduled delayed job"
        );

        Ok(format!("delayed:{}:{}", envelope.job_id, envelope.attempt))
    }

    async fn claim(&self, stage: Stage, consumer: &str, count: usize) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.conn().await?;

        let paused: bool = conn.exists(self.config.paused_key(stage)).await?;
        if paused {
            return Ok(Vec::new());
        }

        self.promote_due(&mut conn, stage).await?;

        let mut deliveries = self.reclaim_stalled(&mut conn, stage, consumer, count).await?;
        if deliveries.len() >= count {
            return Ok(deliveries);
        }

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count - deliveries.len())
            .arg("BLOCK")
            .arg(self.config.block_timeout.as_millis() as u64)
            .arg("STREAMS")
            .arg(self.config.stream_key(stage))
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await?;

        for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream_key.ids {
                if let Some(delivery) = self.decode(&mut conn, stage, consumer, entry, 1).await? {
                    debug!(stage = %stage, job_id = %delivery.envelope.job_id, "Claimed job from stream");
                    deliveries.push(delivery);
                }
            }
        }

        Ok(deliveries)
    }

    fn visibility_timeout(&self) -> Duration {
        self.config.visibility_timeout
    }

    async fn extend(&self, delivery: &Delivery) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let extended: i32 = self
            .extend
            .key(self.config.stream_key(delivery.envelope.stage))
            .arg(&self.config.consumer_group)
            .arg(&delivery.consumer)
            .arg(&delivery.delivery_id)
            .arg(delivery.delivery_count)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let stage = delivery.envelope.stage;
        let stream = self.config.stream_key(stage);
        let now_ms = chrono::Utc::now().timestamp_millis();

        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(&delivery.delivery_id)
            .ignore()
            .cmd("XDEL")
            .arg(&stream)
            .arg(&delivery.delivery_id)
            .ignore()
            .cmd("ZADD")
            .arg(self.config.finished_key(stage))
            .arg(now_ms)
            .arg(&delivery.delivery_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!(entry_id = %delivery.delivery_id, "Acknowledged job");
        Ok(())
    }

    async fn pause(&self, stage: Stage) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(self.config.paused_key(stage), 1).await?;
        info!(stage = %stage, "Paused queue");
        Ok(())
    }

    async fn resume(&self, stage: Stage) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.config.paused_key(stage)).await?;
        info!(stage = %stage, "Resumed queue");
        Ok(())
    }

    async fn is_paused(&self, stage: Stage) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let paused: bool = conn.exists(self.config.paused_key(stage)).await?;
        Ok(paused)
    }

    async fn clean(&self, stage: Stage, grace: Duration) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let cutoff_ms = chrono::Utc::now().timestamp_millis() - grace.as_millis() as i64;
        let removed: u64 = conn
            .zrembyscore(self.config.finished_key(stage), "-inf", cutoff_ms)
            .await?;
        if removed > 0 {
            debug!(stage = %stage, removed, "Cleaned finished entries");
        }
        Ok(removed)
    }

    async fn finished_len(&self, stage: Stage) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.zcard(self.config.finished_key(stage)).await?;
        Ok(len)
    }

    async fn len(&self, stage: Stage) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let total: u64 = conn.xlen(self.config.stream_key(stage)).await?;
        let pending = self.pending_count(&mut conn, stage).await?;
        Ok(total.saturating_sub(pending))
    }

    async fn delayed_len(&self, stage: Stage) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.zcard(self.config.delayed_key(stage)).await?;
        Ok(len)
    }

    async fn in_flight_len(&self, stage: Stage) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        self.pending_count(&mut conn, stage).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdub_models::{ArtifactId, Job, MuxPayload, StagePayload};

    fn config(prefix: &str) -> QueueConfig {
        QueueConfig {
            redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into()),
            key_prefix: format!("vdub-test-{}-{}", prefix, uuid::Uuid::new_v4()),
            consumer_group: "test-workers".into(),
            visibility_timeout: Duration::from_millis(200),
            block_timeout: Duration::from_millis(50),
        }
    }

    fn envelope() -> QueueEnvelope {
        QueueEnvelope::for_job(&Job::new(StagePayload::Mux(MuxPayload {
            artifact_id: ArtifactId::from_string("a1"),
            user_id: "u1".into(),
            video_url: "v.mp4".into(),
            audio_url: "a.wav".into(),
            apply_watermark: true,
        })))
    }

    #[test]
    fn test_key_layout() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.stream_key(Stage::LipSync), "vdub:queue:lipsync");
        assert_eq!(cfg.delayed_key(Stage::Mux), "vdub:queue:mux:delayed");
        assert_eq!(cfg.paused_key(Stage::Mux), "vdub:queue:mux:paused");
        assert_eq!(cfg.finished_key(Stage::Translate), "vdub:queue:translate:finished");
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_claim_ack_and_reclaim() {
        let queue = RedisQueue::new(config("claim")).unwrap();
        queue.init().await.unwrap();

        queue.enqueue(envelope()).await.unwrap();
        let first = queue.claim(Stage::Mux, "crashed", 1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(queue.in_flight_len(Stage::Mux).await.unwrap(), 1);
        assert_eq!(queue.len(Stage::Mux).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = queue.claim(Stage::Mux, "w2", 1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_id, first[0].delivery_id);
        assert!(second[0].delivery_count >= 2);

        // The first holder lost its lease; the new one can extend it
        assert!(!queue.extend(&first[0]).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(queue.extend(&second[0]).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(queue.claim(Stage::Mux, "w3", 1).await.unwrap().is_empty());

        queue.ack(&second[0]).await.unwrap();
        assert!(!queue.extend(&second[0]).await.unwrap());
        let stats = queue.stats(Stage::Mux).await.unwrap();
        assert_eq!(stats.total(), 0);
        assert_eq!(stats.finished, 1);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_pause_and_clean() {
        let queue = RedisQueue::new(config("pause")).unwrap();
        queue.init().await.unwrap();

        queue.enqueue(envelope()).await.unwrap();
        queue.pause(Stage::Mux).await.unwrap();
        assert!(queue.is_paused(Stage::Mux).await.unwrap());
        assert!(queue.claim(Stage::Mux, "w1", 1).await.unwrap().is_empty());

        queue.resume(Stage::Mux).await.unwrap();
        let claimed = queue.claim(Stage::Mux, "w1", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        queue.ack(&claimed[0]).await.unwrap();

        assert_eq!(queue.clean(Stage::Mux, Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.clean(Stage::Mux, Duration::from_millis(10)).await.unwrap(), 1);
        assert_eq!(queue.finished_len(Stage::Mux).await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_delayed_promotion() {
        let queue = RedisQueue::new(config("delayed")).unwrap();
        queue.init().await.unwrap();

        queue
            .enqueue_delayed(envelope().retry(2), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(queue.delayed_len(Stage::Mux).await.unwrap(), 1);
        assert!(queue.claim(Stage::Mux, "w1", 1).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let claimed = queue.claim(Stage::Mux, "w1", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].envelope.attempt, 2);
    }
}
