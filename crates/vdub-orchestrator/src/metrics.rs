//! Pipeline metrics.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use vdub_models::{ErrorKind, Stage};
use vdub_queue::QueueStats;

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_CREATED_TOTAL: &str = "vdub_jobs_created_total";
    pub const JOBS_STARTED_TOTAL: &str = "vdub_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "vdub_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "vdub_jobs_failed_total";
    pub const JOB_RETRIES_TOTAL: &str = "vdub_job_retries_total";
    pub const JOB_DURATION_SECONDS: &str = "vdub_job_duration_seconds";

    pub const STAGE_TRANSITIONS_TOTAL: &str = "vdub_stage_transitions_total";

    pub const DLQ_RECORDS_TOTAL: &str = "vdub_dlq_records_total";
    pub const DLQ_REPLAYS_TOTAL: &str = "vdub_dlq_replays_total";
    pub const DLQ_PURGED_TOTAL: &str = "vdub_dlq_purged_total";

    pub const QUEUE_WAITING: &str = "vdub_queue_waiting";
    pub const QUEUE_IN_FLIGHT: &str = "vdub_queue_in_flight";
    pub const QUEUE_DELAYED: &str = "vdub_queue_delayed";
    pub const QUEUE_FINISHED: &str = "vdub_queue_finished";
    pub const QUEUE_PAUSED: &str = "vdub_queue_paused";
    pub const QUEUE_CLEANED_TOTAL: &str = "vdub_queue_cleaned_total";

    pub const NOTIFICATIONS_SENT_TOTAL: &str = "vdub_notifications_sent_total";
    pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "vdub_notifications_dropped_total";
}

/// Install the Prometheus recorder with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}

fn stage_label(stage: Stage) -> [(&'static str, String); 1] {
    [("stage", stage.as_str().to_string())]
}

pub fn record_job_created(stage: Stage) {
    counter!(names::JOBS_CREATED_TOTAL, &stage_label(stage)).increment(1);
}

pub fn record_job_started(stage: Stage) {
    counter!(names::JOBS_STARTED_TOTAL, &stage_label(stage)).increment(1);
}

pub fn record_job_completed(stage: Stage, duration_secs: Option<f64>) {
    counter!(names::JOBS_COMPLETED_TOTAL, &stage_label(stage)).increment(1);
    if let Some(secs) = duration_secs {
        histogram!(names::JOB_DURATION_SECONDS, &stage_label(stage)).record(secs);
    }
}

pub fn record_job_failed(stage: Stage) {
    counter!(names::JOBS_FAILED_TOTAL, &stage_label(stage)).increment(1);
}

pub fn record_retry(stage: Stage, kind: ErrorKind) {
    let labels = [
        ("stage", stage.as_str().to_string()),
        ("kind", kind.as_str().to_string()),
    ];
    counter!(names::JOB_RETRIES_TOTAL, &labels).increment(1);
}

/// `to` is a stage name, `review` or `completed`.
pub fn record_transition(from: Stage, to: &str) {
    let labels = [
        ("from", from.as_str().to_string()),
        ("to", to.to_string()),
    ];
    counter!(names::STAGE_TRANSITIONS_TOTAL, &labels).increment(1);
}

pub fn record_dead_lettered(stage: Stage) {
    counter!(names::DLQ_RECORDS_TOTAL, &stage_label(stage)).increment(1);
}

pub fn record_replay(stage: Stage) {
    counter!(names::DLQ_REPLAYS_TOTAL, &stage_label(stage)).increment(1);
}

pub fn record_purged(count: usize) {
    counter!(names::DLQ_PURGED_TOTAL).increment(count as u64);
}

pub fn record_queue_stats(stats: &QueueStats) {
    let labels = stage_label(stats.stage);
    gauge!(names::QUEUE_WAITING, &labels).set(stats.waiting as f64);
    gauge!(names::QUEUE_IN_FLIGHT, &labels).set(stats.in_flight as f64);
    gauge!(names::QUEUE_DELAYED, &labels).set(stats.delayed as f64);
    gauge!(names::QUEUE_FINISHED, &labels).set(stats.finished as f64);
    gauge!(names::QUEUE_PAUSED, &labels).set(if stats.paused { 1.0 } else { 0.0 });
}

pub fn record_queue_cleaned(stage: Stage, removed: u64) {
    counter!(names::QUEUE_CLEANED_TOTAL, &stage_label(stage)).increment(removed);
}

pub fn record_notification(event_type: &str, delivered: bool) {
    let labels = [("type", event_type.to_string())];
    if delivered {
        counter!(names::NOTIFICATIONS_SENT_TOTAL, &labels).increment(1);
    } else {
        counter!(names::NOTIFICATIONS_DROPPED_TOTAL, &labels).increment(1);
    }
}
