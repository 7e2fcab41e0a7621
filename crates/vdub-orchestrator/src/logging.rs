//! Structured logging.
//!
//! [`JobLogger`] keeps job lifecycle lines consistent: every line carries the
//! job id, the stage and the artifact so a single job can be followed across
//! retries with one filter.

use tracing::{error, info, warn, Span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vdub_models::{Job, Stage};

/// Install the global subscriber.
///
/// `LOG_FORMAT=json` switches to JSON lines; otherwise output is human
/// readable. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vdub=info,info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    artifact_id: String,
    stage: Stage,
}

impl JobLogger {
    pub fn new(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            artifact_id: job.artifact_id.to_string(),
            stage: job.stage,
        }
    }

    pub fn log_start(&self, attempt: u32) {
        info!(
            job_id = %self.job_id,
            artifact_id = %self.artifact_id,
            stage = %self.stage,
            attempt,
            "Stage job started"
        );
    }

    pub fn log_progress(&self, progress: u8) {
        info!(
            job_id = %self.job_id,
            artifact_id = %self.artifact_id,
            stage = %self.stage,
            progress,
            "Stage job progress"
        );
    }

    pub fn log_retry(&self, attempt: u32, max_attempts: u32, delay_ms: u64, message: &str) {
        warn!(
            job_id = %self.job_id,
            artifact_id = %self.artifact_id,
            stage = %self.stage,
            attempt,
            max_attempts,
            delay_ms,
            "Stage job will be retried: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            artifact_id = %self.artifact_id,
            stage = %self.stage,
            "Stage job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            artifact_id = %self.artifact_id,
            stage = %self.stage,
            "Stage job error: {}", message
        );
    }

    pub fn log_completion(&self) {
        info!(
            job_id = %self.job_id,
            artifact_id = %self.artifact_id,
            stage = %self.stage,
            "Stage job completed"
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Span for instrumenting the whole attempt.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "stage_job",
            job_id = %self.job_id,
            artifact_id = %self.artifact_id,
            stage = %self.stage
        )
    }
}
