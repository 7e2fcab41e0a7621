//! Orchestrator configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use vdub_models::Stage;
use vdub_queue::{DeadLetterRetention, QueueConfig, RetryPolicy, DEFAULT_CLEAN_GRACE};

use crate::error::{OrchestratorError, OrchestratorResult};

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Stage executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum concurrent stage jobs in this process
    pub max_concurrent_jobs: usize,
    /// Deliveries claimed per poll
    pub claim_batch: usize,
    /// Sleep between empty polls
    pub poll_interval: Duration,
    /// A stage attempt running longer than this fails with a timeout
    pub stage_timeout: Duration,
    /// Lease extension period while a handler runs; `None` disables it
    pub heartbeat_interval: Option<Duration>,
    /// How long to wait for in-flight jobs on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            claim_batch: 5,
            poll_interval: Duration::from_millis(500),
            stage_timeout: Duration::from_secs(3600), // 1 hour
            heartbeat_interval: Some(Duration::from_secs(30)),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_jobs: env_parse("EXECUTOR_MAX_JOBS").unwrap_or(defaults.max_concurrent_jobs),
            claim_batch: env_parse("EXECUTOR_CLAIM_BATCH").unwrap_or(defaults.claim_batch),
            poll_interval: env_parse("EXECUTOR_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            stage_timeout: env_parse("EXECUTOR_STAGE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stage_timeout),
            // 0 turns the heartbeat off
            heartbeat_interval: match env_parse::<u64>("EXECUTOR_HEARTBEAT_SECS") {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.heartbeat_interval,
            },
            shutdown_timeout: env_parse("EXECUTOR_SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
        }
    }

    /// Check the settings against the queue's visibility timeout.
    ///
    /// A claimed delivery must be extended, or finish, before it becomes
    /// visible again, otherwise a second consumer runs it concurrently.
    pub fn validate(&self, visibility_timeout: Duration) -> OrchestratorResult<()> {
        if self.max_concurrent_jobs == 0 || self.claim_batch == 0 {
            return Err(OrchestratorError::config_error(
                "max_concurrent_jobs and claim_batch must be positive",
            ));
        }
        match self.heartbeat_interval {
            Some(every) if every.is_zero() || every >= visibility_timeout => {
                Err(OrchestratorError::config_error(format!(
                    "heartbeat interval {}s must be positive and below the visibility timeout {}s",
                    every.as_secs(),
                    visibility_timeout.as_secs()
                )))
            }
            None if self.stage_timeout >= visibility_timeout => {
                Err(OrchestratorError::config_error(format!(
                    "stage timeout {}s must be below the visibility timeout {}s when the heartbeat is off",
                    self.stage_timeout.as_secs(),
                    visibility_timeout.as_secs()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub queue: QueueConfig,
    pub retry: RetryPolicy,
    pub retention: DeadLetterRetention,
    pub executor: ExecutorConfig,
    /// Stages this process executes; empty means control plane only
    pub executor_stages: Vec<Stage>,
    /// Adapter registry file
    pub adapter_config_path: Option<PathBuf>,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub dlq_purge_interval: Duration,
    pub queue_depth_interval: Duration,
    /// Finished queue entries older than this are cleaned
    pub queue_clean_grace: Duration,
    /// Buffered notifications before new ones are dropped
    pub outbox_capacity: usize,
    pub metrics_addr: SocketAddr,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            retention: DeadLetterRetention::default(),
            executor: ExecutorConfig::default(),
            executor_stages: Vec::new(),
            adapter_config_path: None,
            health_check_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(5),
            dlq_purge_interval: Duration::from_secs(3600),
            queue_depth_interval: Duration::from_secs(15),
            queue_clean_grace: DEFAULT_CLEAN_GRACE,
            outbox_capacity: 1024,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl OrchestratorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue: QueueConfig::from_env(),
            retry: RetryPolicy::from_env(),
            retention: DeadLetterRetention::from_env(),
            executor: ExecutorConfig::from_env(),
            executor_stages: std::env::var("EXECUTOR_STAGES")
                .map(|s| parse_stages(&s))
                .unwrap_or_default(),
            adapter_config_path: std::env::var("ADAPTER_CONFIG_PATH").ok().map(PathBuf::from),
            health_check_interval: env_parse("HEALTH_CHECK_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_check_interval),
            health_check_timeout: env_parse("HEALTH_CHECK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_check_timeout),
            dlq_purge_interval: env_parse("DLQ_PURGE_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.dlq_purge_interval),
            queue_depth_interval: env_parse("QUEUE_DEPTH_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.queue_depth_interval),
            queue_clean_grace: env_parse("QUEUE_CLEAN_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.queue_clean_grace),
            outbox_capacity: env_parse("OUTBOX_CAPACITY").unwrap_or(defaults.outbox_capacity),
            metrics_addr: env_parse("METRICS_ADDR").unwrap_or(defaults.metrics_addr),
        }
    }
}

/// Parse a comma-separated stage list, skipping unknown names.
pub fn parse_stages(raw: &str) -> Vec<Stage> {
    let mut stages: Vec<Stage> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    stages.sort();
    stages.dedup();
    stages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stages() {
        assert_eq!(
            parse_stages("mux, stt,lipsync,bogus,,mux"),
            vec![Stage::Transcribe, Stage::Mux, Stage::LipSync]
        );
        assert!(parse_stages("").is_empty());
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retention.max_count, 1000);
        assert_eq!(config.health_check_timeout, Duration::from_secs(5));
        assert!(config.executor_stages.is_empty());
        assert_eq!(config.queue_clean_grace, Duration::from_secs(3600));
    }

    #[test]
    fn test_default_executor_fits_default_visibility() {
        let config = OrchestratorConfig::default();
        assert!(config.executor.validate(config.queue.visibility_timeout).is_ok());
    }

    #[test]
    fn test_stage_timeout_must_fit_visibility_without_heartbeat() {
        let visibility = Duration::from_secs(600);
        let mut executor = ExecutorConfig {
            heartbeat_interval: None,
            ..ExecutorConfig::default()
        };
        let err = executor.validate(visibility).unwrap_err();
        assert!(err.to_string().contains("stage timeout 3600s"));

        executor.stage_timeout = Duration::from_secs(300);
        assert!(executor.validate(visibility).is_ok());
    }

    #[test]
    fn test_heartbeat_must_beat_within_visibility() {
        let visibility = Duration::from_secs(600);
        for every in [Duration::ZERO, Duration::from_secs(600), Duration::from_secs(900)] {
            let executor = ExecutorConfig {
                heartbeat_interval: Some(every),
                ..ExecutorConfig::default()
            };
            assert!(executor.validate(visibility).is_err(), "{every:?} accepted");
        }
    }
}
