//! Model adapters for the dubbing pipeline.
//!
//! The orchestrator never talks to model back-ends directly. Each stage is
//! served by one of several registered [`ModelAdapter`]s, picked by the
//! [`AdapterRegistry`] from configuration, capabilities and the last
//! active health probe.

pub mod adapter;
pub mod config_file;
pub mod error;
pub mod health;
pub mod http;
pub mod registry;
pub mod types;

pub use adapter::ModelAdapter;
pub use config_file::{HealthCheckSettings, RegistryConfigFile};
pub use error::{AdapterError, AdapterResult};
pub use health::HealthMonitor;
pub use http::{HttpAdapterConfig, HttpModelAdapter};
pub use registry::AdapterRegistry;
pub use types::{
    AdapterCapabilities, AdapterConfig, AdapterMetadata, AdapterStage, AdapterSummary,
    HealthCheckResult, HealthStatus, ModelHealth, SelectOptions, StageSummary,
};
