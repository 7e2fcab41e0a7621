//! Adapter contract.

use async_trait::async_trait;

use crate::error::AdapterResult;
use crate::types::{AdapterStage, HealthCheckResult};

/// A pluggable model implementation for one stage.
///
/// Input and output are opaque stage-specific JSON; the orchestrator does
/// not look inside.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn stage(&self) -> AdapterStage;

    async fn invoke(&self, input: serde_json::Value) -> AdapterResult<serde_json::Value>;

    async fn health_check(&self) -> HealthCheckResult;
}
