//! Queue & retry engine primitives for the dubbing pipeline.
//!
//! This crate provides:
//! - Failure classification and backoff policy
//! - One queue per stage (in-memory or Redis Streams) with delayed retries
//!   and stalled-delivery reclaim
//! - Dead-letter storage with replay audit trail
//! - Pipeline events via Redis Pub/Sub

pub mod backend;
pub mod classifier;
pub mod dead_letter;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod progress;
pub mod redis_queue;
pub mod retry;

pub use backend::{QueueBackend, QueueStats, DEFAULT_CLEAN_GRACE};
pub use classifier::{Classification, ErrorClassifier};
pub use dead_letter::{
    DeadLetterRecord, DeadLetterRetention, DeadLetterStats, DeadLetterStore,
    MemoryDeadLetterStore, RedisDeadLetterStore, ReplayAudit,
};
pub use envelope::{Delivery, QueueEnvelope};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryQueue;
pub use progress::{EventChannel, UserEvent};
pub use redis_queue::{QueueConfig, RedisQueue};
pub use retry::{RetryDecision, RetryPolicy};
