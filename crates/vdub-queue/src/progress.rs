//! Pipeline events via Redis Pub/Sub.

use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;

use vdub_models::PipelineEvent;

use crate::error::QueueResult;

/// Event addressed to one user, as published to Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEvent {
    pub user_id: String,
    pub event: PipelineEvent,
}

/// Channel for publishing/subscribing to per-user pipeline events.
pub struct EventChannel {
    client: redis::Client,
    prefix: String,
}

impl EventChannel {
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    /// Get the channel name for a user.
    pub fn channel_name(&self, user_id: &str) -> String {
        format!("{}:events:{}", self.prefix, user_id)
    }

    pub async fn publish(&self, user_id: &str, event: &PipelineEvent) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = self.channel_name(user_id);
        let payload = serde_json::to_string(&UserEvent {
            user_id: user_id.to_string(),
            event: event.clone(),
        })?;

        debug!(event = event.event_type().as_str(), "Publishing pipeline event to {}", channel);
        conn.publish::<_, _, ()>(channel, payload).await?;

        Ok(())
    }

    /// Subscribe to a user's events.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(
        &self,
        user_id: &str,
    ) -> QueueResult<std::pin::Pin<Box<dyn futures::Stream<Item = UserEvent> + Send>>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel_name(user_id)).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });

        Ok(Box::pin(stream))
    }
}
