//! Prometheus metrics for matching-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "matching_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for match workflow operations by outcome.
pub static MATCH_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_operations_total",
        "Total number of match workflow operations",
        &["operation", "status"]
    )
    .expect("Failed to register MATCH_OPERATIONS")
});

/// Counter for auto-match proposals by candidate kind.
pub static MATCH_PROPOSALS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_proposals_total",
        "Total number of auto-match proposals",
        &["candidate_kind"]
    )
    .expect("Failed to register MATCH_PROPOSALS")
});

/// Counter for alias decay passes.
pub static ALIAS_DECAY: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_alias_decay_total",
        "Total number of alias decay passes",
        &["status"]
    )
    .expect("Failed to register ALIAS_DECAY")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&MATCH_OPERATIONS);
    Lazy::force(&MATCH_PROPOSALS);
    Lazy::force(&ALIAS_DECAY);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a match workflow operation.
pub fn record_match_operation(operation: &str, status: &str) {
    MATCH_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record an auto-match proposal.
pub fn record_match_proposal(candidate_kind: &str) {
    MATCH_PROPOSALS.with_label_values(&[candidate_kind]).inc();
}

/// Record an alias decay pass.
pub fn record_alias_decay(status: &str) {
    ALIAS_DECAY.with_label_values(&[status]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
