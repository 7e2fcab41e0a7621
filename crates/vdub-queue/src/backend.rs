//! Queue backend contract.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vdub_models::Stage;

use crate::envelope::{Delivery, QueueEnvelope};
use crate::error::QueueResult;

/// Depth of one stage queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub stage: Stage,
    /// Ready to be claimed
    pub waiting: u64,
    /// Claimed, not yet acked
    pub in_flight: u64,
    /// Scheduled retries not yet due
    pub delayed: u64,
    /// Acked deliveries kept until the next clean
    #[serde(default)]
    pub finished: u64,
    #[serde(default)]
    pub paused: bool,
}

impl QueueStats {
    /// Entries not yet handled.
    pub fn total(&self) -> u64 {
        self.waiting + self.in_flight + self.delayed
    }
}

/// One durable queue per stage with at-least-once delivery.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append an envelope to its stage queue; returns the entry id.
    async fn enqueue(&self, envelope: QueueEnvelope) -> QueueResult<String>;

    /// Schedule an envelope to become claimable after `delay`.
    async fn enqueue_delayed(&self, envelope: QueueEnvelope, delay: Duration) -> QueueResult<String>;

    /// Claim up to `count` entries for `consumer`.
    ///
    /// Due delayed entries are promoted first, then entries held longer than
    /// the visibility timeout are redelivered, then new entries are handed
    /// out. No entry is held by two consumers at once. A paused stage
    /// hands out nothing.
    async fn claim(&self, stage: Stage, consumer: &str, count: usize) -> QueueResult<Vec<Delivery>>;

    /// How long a claimed delivery may go without [`extend`](Self::extend)
    /// before another consumer may reclaim it.
    fn visibility_timeout(&self) -> Duration;

    /// Restart the visibility clock of a delivery still being worked on.
    ///
    /// Returns `false` when the lease is gone: the delivery was acked or
    /// reclaimed by another consumer since `delivery` was handed out.
    async fn extend(&self, delivery: &Delivery) -> QueueResult<bool>;

    /// Remove a handled delivery from the queue.
    ///
    /// The entry id is kept in the stage's finished set until [`clean`](Self::clean).
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Stop handing out entries of `stage`. Enqueues and in-flight work
    /// continue.
    async fn pause(&self, stage: Stage) -> QueueResult<()>;

    async fn resume(&self, stage: Stage) -> QueueResult<()>;

    async fn is_paused(&self, stage: Stage) -> QueueResult<bool>;

    /// Drop finished entries acked more than `grace` ago; returns how many
    /// were removed.
    async fn clean(&self, stage: Stage, grace: Duration) -> QueueResult<u64>;

    async fn finished_len(&self, stage: Stage) -> QueueResult<u64>;

    async fn len(&self, stage: Stage) -> QueueResult<u64>;

    async fn delayed_len(&self, stage: Stage) -> QueueResult<u64>;

    async fn in_flight_len(&self, stage: Stage) -> QueueResult<u64>;

    async fn stats(&self, stage: Stage) -> QueueResult<QueueStats> {
        Ok(QueueStats {
            stage,
            waiting: self.len(stage).await?,
            in_flight: self.in_flight_len(stage).await?,
            delayed: self.delayed_len(stage).await?,
            finished: self.finished_len(stage).await?,
            paused: self.is_paused(stage).await?,
        })
    }

    /// Stats for every stage, in pipeline order.
    async fn all_stats(&self) -> QueueResult<Vec<QueueStats>> {
        let mut all = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            all.push(self.stats(stage).await?);
        }
        Ok(all)
    }
}

/// Default age after which finished entries are cleaned.
pub const DEFAULT_CLEAN_GRACE: Duration = Duration::from_secs(3600);
