//! Store metrics.

use metrics::counter;

/// Metric name constants for consistency.
pub mod names {
    /// Compare-and-set attempts by entity and outcome.
    pub const CAS_TOTAL: &str = "vdub_store_cas_total";
}

/// Record the outcome of a compare-and-set write.
pub fn record_cas(entity: &'static str, applied: bool) {
    counter!(
        names::CAS_TOTAL,
        "entity" => entity,
        "outcome" => if applied { "applied" } else { "conflict" }
    )
    .increment(1);
}
