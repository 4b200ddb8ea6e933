// Metrics module for Prometheus observability

mod registry;

pub use registry::{
    gather_metrics, CREDENTIAL_ACTIVE, CREDENTIAL_STATUS, OAUTH_REFRESHES, QUEUE_DEPTH,
    QUEUE_REJECTIONS, REQUESTS_TOTAL, REQUEST_DURATION, SCHEDULER_OUTCOMES, SSE_CONNECTIONS,
    SSE_EVENTS, UPSTREAM_CALLS, UPSTREAM_DURATION,
};

use crate::scheduler::{LastStatus, Outcome};

/// Helper to record ingress request metrics
pub fn record_request(method: &str, endpoint: &str, status_code: u16, model: &str, duration_secs: f64) {
    REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, &status_code.to_string(), model])
        .inc();

    REQUEST_DURATION
        .with_label_values(&[method, endpoint, &status_code.to_string()])
        .observe(duration_secs);
}

/// Helper to record one upstream generateContent call
pub fn record_upstream_call(model: &str, status_code: u16, streaming: bool, duration_secs: f64) {
    UPSTREAM_CALLS
        .with_label_values(&[model, &status_code.to_string(), &streaming.to_string()])
        .inc();

    UPSTREAM_DURATION
        .with_label_values(&[model, &streaming.to_string()])
        .observe(duration_secs);
}

fn outcome_label(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Success => "success",
        Outcome::RateLimited { .. } => "rate_limited",
        Outcome::AuthFailed => "auth_failed",
        Outcome::ServerError => "server_error",
        Outcome::NetworkError => "network_error",
    }
}

/// Record an outcome the scheduler reports for a selected credential.
pub fn record_scheduler_outcome(outcome: &Outcome) {
    SCHEDULER_OUTCOMES.with_label_values(&[outcome_label(outcome)]).inc();
}

/// Snapshot the active-request gauge for one credential.
pub fn set_credential_active(token_prefix: &str, active_count: u32) {
    CREDENTIAL_ACTIVE.with_label_values(&[token_prefix]).set(active_count as f64);
}

/// Snapshot the aggregate count of credentials per scheduler status.
pub fn set_credential_status_counts(active: usize, rate_limited: usize, disabled: usize) {
    CREDENTIAL_STATUS.with_label_values(&["active"]).set(active as f64);
    CREDENTIAL_STATUS.with_label_values(&["rate_limited"]).set(rate_limited as f64);
    CREDENTIAL_STATUS.with_label_values(&["disabled"]).set(disabled as f64);
}

pub fn record_oauth_refresh(success: bool) {
    let status = if success { "success" } else { "failure" };
    OAUTH_REFRESHES.with_label_values(&[status]).inc();
}

/// Snapshot the admission queue's in-flight/waiting gauges.
pub fn set_queue_depth(in_flight: usize, waiting: usize) {
    QUEUE_DEPTH.with_label_values(&["in_flight"]).set(in_flight as f64);
    QUEUE_DEPTH.with_label_values(&["waiting"]).set(waiting as f64);
}

/// Snapshot only the in-flight gauge, leaving `waiting` untouched.
pub fn set_queue_in_flight(in_flight: usize) {
    QUEUE_DEPTH.with_label_values(&["in_flight"]).set(in_flight as f64);
}

pub fn record_queue_rejection(reason: &str) {
    QUEUE_REJECTIONS.with_label_values(&[reason]).inc();
}

pub fn record_sse_event(event_type: &str, model: &str) {
    SSE_EVENTS.with_label_values(&[event_type, model]).inc();
}

pub fn record_sse_connection(status: &str) {
    SSE_CONNECTIONS.with_label_values(&[status]).inc();
}

/// Used for logging/diagnostics endpoints that want the human-readable
/// per-credential status string rather than the metric label.
pub fn last_status_label(status: LastStatus) -> &'static str {
    status.as_str()
}
