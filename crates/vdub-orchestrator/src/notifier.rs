//! Notification outbox.
//!
//! Orchestration code hands events to a [`Notifier`], which only pushes them
//! onto a bounded channel. A separate [`OutboxDispatcher`] task drains the
//! channel into a [`NotificationSink`]. A full outbox or a failing sink drops
//! the event with a warning and never fails the caller.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vdub_models::PipelineEvent;
use vdub_queue::{EventChannel, UserEvent};

use crate::error::OrchestratorResult;
use crate::metrics;

/// Destination for user notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &UserEvent) -> OrchestratorResult<()>;
}

/// Publishes to the per-user Redis channel.
pub struct RedisEventSink {
    channel: EventChannel,
}

impl RedisEventSink {
    pub fn new(channel: EventChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl NotificationSink for RedisEventSink {
    async fn deliver(&self, event: &UserEvent) -> OrchestratorResult<()> {
        self.channel.publish(&event.user_id, &event.event).await?;
        Ok(())
    }
}

/// Keeps delivered events in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<UserEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<UserEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn deliver(&self, event: &UserEvent) -> OrchestratorResult<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Fire-and-forget handle used by the orchestration services.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<UserEvent>,
}

impl Notifier {
    pub fn send_to_user(&self, user_id: &str, event: PipelineEvent) {
        let event_type = event.event_type().as_str();
        let item = UserEvent {
            user_id: user_id.to_string(),
            event,
        };
        if let Err(e) = self.tx.try_send(item) {
            warn!(user_id, event_type, error = %e, "Dropping notification");
            metrics::record_notification(event_type, false);
        }
    }
}

/// Receiving side of the outbox.
pub struct Outbox {
    rx: mpsc::Receiver<UserEvent>,
}

/// Create a bounded outbox.
pub fn outbox(capacity: usize) -> (Notifier, Outbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Notifier { tx }, Outbox { rx })
}

impl Outbox {
    /// Take everything currently queued without waiting.
    pub fn drain_pending(&mut self) -> Vec<UserEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn into_dispatcher(self, sink: Arc<dyn NotificationSink>) -> OutboxDispatcher {
        OutboxDispatcher { rx: self.rx, sink }
    }
}

pub struct OutboxDispatcher {
    rx: mpsc::Receiver<UserEvent>,
    sink: Arc<dyn NotificationSink>,
}

impl OutboxDispatcher {
    /// Deliver events until every [`Notifier`] is dropped or shutdown is
    /// signalled. Events still buffered at shutdown are flushed first.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Notification outbox dispatcher started");
            loop {
                tokio::select! {
                    maybe = self.rx.recv() => match maybe {
                        Some(event) => self.dispatch(event).await,
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            while let Ok(event) = self.rx.try_recv() {
                                self.dispatch(event).await;
                            }
                            break;
                        }
                    }
                }
            }
            info!("Notification outbox dispatcher stopped");
        })
    }

    async fn dispatch(&self, event: UserEvent) {
        let event_type = event.event.event_type().as_str();
        match self.sink.deliver(&event).await {
            Ok(()) => {
                debug!(user_id = %event.user_id, event_type, "Notification delivered");
                metrics::record_notification(event_type, true);
            }
            Err(e) => {
                warn!(user_id = %event.user_id, event_type, error = %e, "Notification delivery failed");
                metrics::record_notification(event_type, false);
            }
        }
    }
}
