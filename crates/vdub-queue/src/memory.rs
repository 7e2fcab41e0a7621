//! In-process queue backend.
//!
//! Every operation runs under one lock, so claims are atomic across
//! concurrent consumers. Used by tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use vdub_models::Stage;

use crate::backend::QueueBackend;
use crate::envelope::{Delivery, QueueEnvelope};
use crate::error::{QueueError, QueueResult};

struct Entry {
    id: String,
    envelope: QueueEnvelope,
    deliveries: u32,
}

struct Held {
    entry: Entry,
    consumer: String,
    claimed_at: Instant,
}

#[derive(Default)]
struct StageQueue {
    ready: VecDeque<Entry>,
    delayed: Vec<(Instant, Entry)>,
    in_flight: HashMap<String, Held>,
    /// Acked entry ids with their ack time, oldest first
    finished: VecDeque<(Instant, String)>,
    paused: bool,
}

impl StageQueue {
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = pending;
        due.sort_by_key(|(at, _)| *at);
        self.ready.extend(due.into_iter().map(|(_, entry)| entry));
    }
}

pub struct MemoryQueue {
    stages: Mutex<HashMap<Stage, StageQueue>>,
    visibility_timeout: Duration,
    next_id: AtomicU64,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            stages: Mutex::new(HashMap::new()),
            visibility_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_entry(&self, envelope: QueueEnvelope) -> Entry {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        Entry {
            id: format!("{}-{}", envelope.stage, n),
            envelope,
            deliveries: 0,
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, envelope: QueueEnvelope) -> QueueResult<String> {
        let stage = envelope.stage;
        let entry = self.next_entry(envelope);
        let id = entry.id.clone();

        debug!(stage = %stage, entry_id = %id, job_id = %entry.envelope.job_id, "Enqueued job");
        self.stages.lock().await.entry(stage).or_default().ready.push_back(entry);
        Ok(id)
    }

    async fn enqueue_delayed(&self, envelope: QueueEnvelope, delay: Duration) -> QueueResult<String> {
        let stage = envelope.stage;
        let entry = self.next_entry(envelope);
        let id = entry.id.clone();

        debug!(
            stage = %stage,
            entry_id = %id,
            delay_ms = delay.as_millis() as u64,
            "Scheduled delayed job"
        );
        self.stages
            .lock()
            .await
            .entry(stage)
            .or_default()
            .delayed
            .push((Instant::now() + delay, entry));
        Ok(id)
    }

    async fn claim(&self, stage: Stage, consumer: &str, count: usize) -> QueueResult<Vec<Delivery>> {
        let mut stages = self.stages.lock().await;
        let queue = stages.entry(stage).or_default();
        if queue.paused {
            return Ok(Vec::new());
        }
        let now = Instant::now();

        queue.promote_due(now);

        let mut claimed: Vec<Delivery> = Vec::new();

        // Stalled deliveries first
        let mut stalled: Vec<String> = queue
            .in_flight
            .iter()
            .filter(|(_, held)| now.duration_since(held.claimed_at) >= self.visibility_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        stalled.sort();

        for id in stalled.into_iter().take(count) {
            if let Some(held) = queue.in_flight.get_mut(&id) {
                info!(
                    stage = %stage,
                    entry_id = %id,
                    previous_consumer = %held.consumer,
                    consumer,
                    "Reclaiming stalled delivery"
                );
                held.consumer = consumer.to_string();
                held.claimed_at = now;
                held.entry.deliveries += 1;
                claimed.push(Delivery {
                    delivery_id: id.clone(),
                    consumer: consumer.to_string(),
                    envelope: held.entry.envelope.clone(),
                    delivery_count: held.entry.deliveries,
                });
            }
        }

        while claimed.len() < count {
            let Some(mut entry) = queue.ready.pop_front() else {
                break;
            };
            entry.deliveries += 1;
            claimed.push(Delivery {
                delivery_id: entry.id.clone(),
                consumer: consumer.to_string(),
                envelope: entry.envelope.clone(),
                delivery_count: entry.deliveries,
            });
            queue.in_flight.insert(
                entry.id.clone(),
                Held {
                    entry,
                    consumer: consumer.to_string(),
                    claimed_at: now,
                },
            );
        }

        Ok(claimed)
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    async fn extend(&self, delivery: &Delivery) -> QueueResult<bool> {
        let mut stages = self.stages.lock().await;
        let held = stages
            .get_mut(&delivery.envelope.stage)
            .and_then(|q| q.in_flight.get_mut(&delivery.delivery_id))
            .filter(|held| {
                held.consumer == delivery.consumer && held.entry.deliveries == delivery.delivery_count
            });

        match held {
            Some(held) => {
                held.claimed_at = Instant::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut stages = self.stages.lock().await;
        let removed = stages.get_mut(&delivery.envelope.stage).and_then(|q| {
            let held = q.in_flight.remove(&delivery.delivery_id)?;
            q.finished.push_back((Instant::now(), held.entry.id));
            Some(())
        });

        match removed {
            Some(()) => {
                debug!(entry_id = %delivery.delivery_id, "Acknowledged job");
                Ok(())
            }
            None => Err(QueueError::delivery_not_found(&delivery.delivery_id)),
        }
    }

    async fn pause(&self, stage: Stage) -> QueueResult<()> {
        self.stages.lock().await.entry(stage).or_default().paused = true;
        info!(stage = %stage, "Paused queue");
        Ok(())
    }

    async fn resume(&self, stage: Stage) -> QueueResult<()> {
        self.stages.lock().await.entry(stage).or_default().paused = false;
        info!(stage = %stage, "Resumed queue");
        Ok(())
    }

    async fn is_paused(&self, stage: Stage) -> QueueResult<bool> {
        let stages = self.stages.lock().await;
        Ok(stages.get(&stage).map(|q| q.paused).unwrap_or(false))
    }

    async fn clean(&self, stage: Stage, grace: Duration) -> QueueResult<u64> {
        let mut stages = self.stages.lock().await;
        let Some(queue) = stages.get_mut(&stage) else {
            return Ok(0);
        };
        let now = Instant::now();
        let mut removed = 0;
        while let Some((acked_at, _)) = queue.finished.front() {
            if now.duration_since(*acked_at) < grace {
                break;
            }
            queue.finished.pop_front();
            removed += 1;
        }
        if removed > 0 {
            debug!(stage = %stage, removed, "Cleaned finished entries");
        }
        Ok(removed)
    }

    async fn finished_len(&self, stage: Stage) -> QueueResult<u64> {
        let stages = self.stages.lock().await;
        Ok(stages.get(&stage).map(|q| q.finished.len() as u64).unwrap_or(0))
    }

    async fn len(&self, stage: Stage) -> QueueResult<u64> {
        let stages = self.stages.lock().await;
        Ok(stages.get(&stage).map(|q| q.ready.len() as u64).unwrap_or(0))
    }

    async fn delayed_len(&self, stage: Stage) -> QueueResult<u64> {
        let stages = self.stages.lock().await;
        Ok(stages.get(&stage).map(|q| q.delayed.len() as u64).unwrap_or(0))
    }

    async fn in_flight_len(&self, stage: Stage) -> QueueResult<u64> {
        let stages = self.stages.lock().await;
        Ok(stages.get(&stage).map(|q| q.in_flight.len() as u64).unwrap_or(0))
    }
}
