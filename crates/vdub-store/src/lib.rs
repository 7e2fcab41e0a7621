//! Persistence for pipeline state.
//!
//! This crate provides:
//! - Repository traits for jobs, artifacts and context maps
//! - Compare-and-set status transitions and versioned context map updates
//! - In-memory and Redis implementations

pub mod error;
pub mod memory;
pub mod metrics;
pub mod redis_store;
pub mod repos;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use repos::{ArtifactRepository, ContextMapRepository, JobRepository};
