//! Queue error types.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    #[error("Delivery not found: {0}")]
    DeliveryNotFound(String),

    #[error("Dead letter record not found: {0}")]
    DeadLetterNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn enqueue_failed(msg: impl Into<String>) -> Self {
        Self::EnqueueFailed(msg.into())
    }

    pub fn delivery_not_found(id: impl Into<String>) -> Self {
        Self::DeliveryNotFound(id.into())
    }

    pub fn dead_letter_not_found(id: impl Into<String>) -> Self {
        Self::DeadLetterNotFound(id.into())
    }
}
