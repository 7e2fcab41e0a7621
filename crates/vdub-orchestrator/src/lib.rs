//! Dubbing pipeline orchestrator.
//!
//! This crate provides:
//! - Job manager owning the job lifecycle and stage transitions
//! - Retry engine and dead letter queue for failed attempts
//! - Context map ledger shared by stage workers
//! - Stage executor consuming the per-stage queues
//! - Outbox-based user notifications

pub mod config;
pub mod dead_letter;
pub mod entitlement;
pub mod error;
pub mod executor;
pub mod job_manager;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod notifier;
pub mod retry_engine;
pub mod service;
pub mod transitions;

pub use config::{ExecutorConfig, OrchestratorConfig};
pub use dead_letter::DeadLetterQueue;
pub use entitlement::{Capability, EntitlementProvider, StaticEntitlements};
pub use error::{OrchestratorError, OrchestratorResult};
pub use executor::{AdapterStageHandler, ProgressReporter, StageExecutor, StageHandler};
pub use job_manager::JobManager;
pub use ledger::SegmentLedger;
pub use logging::JobLogger;
pub use notifier::{MemorySink, NotificationSink, Notifier, Outbox, RedisEventSink};
pub use retry_engine::{FailureOutcome, RetryEngine};
pub use service::{Backends, InMemory, Orchestrator};
pub use transitions::{StageOutcome, Transition};
