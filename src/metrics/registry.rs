// Prometheus metrics registry and collectors

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec_with_registry, register_gauge_vec_with_registry,
    register_histogram_vec_with_registry, CounterVec, Encoder, GaugeVec, HistogramVec, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // REQUEST METRICS
    // ============================================================================

    /// Total number of ingress requests
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec_with_registry!(
        Opts::new("requests_total", "Total number of ingress requests"),
        &["method", "endpoint", "status_code", "model"],
        REGISTRY
    ).unwrap();

    /// Request duration histogram
    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec_with_registry!(
        prometheus::HistogramOpts::new("request_duration_seconds", "Request duration in seconds")
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["method", "endpoint", "status_code"],
        REGISTRY
    ).unwrap();

    // ============================================================================
    // UPSTREAM CALL METRICS
    // ============================================================================

    /// Total upstream generateContent calls
    pub static ref UPSTREAM_CALLS: CounterVec = register_counter_vec_with_registry!(
        Opts::new("upstream_calls_total", "Total upstream generateContent calls"),
        &["model", "status_code", "streaming"],
        REGISTRY
    ).unwrap();

    /// Upstream call duration
    pub static ref UPSTREAM_DURATION: HistogramVec = register_histogram_vec_with_registry!(
        prometheus::HistogramOpts::new("upstream_duration_seconds", "Upstream call duration")
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["model", "streaming"],
        REGISTRY
    ).unwrap();

    // ============================================================================
    // SCHEDULER / CREDENTIAL METRICS
    // ============================================================================

    /// Per-credential outcomes reported back to the scheduler
    pub static ref SCHEDULER_OUTCOMES: CounterVec = register_counter_vec_with_registry!(
        Opts::new("scheduler_outcomes_total", "Total outcomes reported to the credential scheduler"),
        &["outcome"], // success, rate_limited, auth_failed, server_error, network_error
        REGISTRY
    ).unwrap();

    /// Currently active (in-flight) requests per credential, keyed by token prefix
    pub static ref CREDENTIAL_ACTIVE: GaugeVec = register_gauge_vec_with_registry!(
        Opts::new("credential_active_requests", "In-flight requests currently assigned to a credential"),
        &["token_prefix"],
        REGISTRY
    ).unwrap();

    /// Count of enabled credentials by scheduler status
    pub static ref CREDENTIAL_STATUS: GaugeVec = register_gauge_vec_with_registry!(
        Opts::new("credentials_by_status", "Number of enabled credentials in each scheduler status"),
        &["status"], // active, rate_limited, disabled
        REGISTRY
    ).unwrap();

    /// OAuth token refresh events
    pub static ref OAUTH_REFRESHES: CounterVec = register_counter_vec_with_registry!(
        Opts::new("oauth_token_refreshes_total", "Total OAuth token refreshes"),
        &["status"], // success, failure
        REGISTRY
    ).unwrap();

    // ============================================================================
    // ADMISSION QUEUE METRICS
    // ============================================================================

    /// Current admission queue depth
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec_with_registry!(
        Opts::new("admission_queue_depth", "Current admission queue occupancy"),
        &["state"], // in_flight, waiting
        REGISTRY
    ).unwrap();

    /// Requests rejected by the admission queue
    pub static ref QUEUE_REJECTIONS: CounterVec = register_counter_vec_with_registry!(
        Opts::new("admission_queue_rejections_total", "Total requests rejected by the admission queue"),
        &["reason"], // queue_full, paused, timeout
        REGISTRY
    ).unwrap();

    // ============================================================================
    // STREAMING METRICS
    // ============================================================================

    /// SSE events emitted by the tag-splitting transformer
    pub static ref SSE_EVENTS: CounterVec = register_counter_vec_with_registry!(
        Opts::new("sse_events_total", "Total stream events emitted to clients"),
        &["event_type", "model"], // event_type: text, thinking, tool_calls
        REGISTRY
    ).unwrap();

    /// SSE connection lifecycle events
    pub static ref SSE_CONNECTIONS: CounterVec = register_counter_vec_with_registry!(
        Opts::new("sse_connections_total", "Total SSE connections"),
        &["status"], // opened, closed, error
        REGISTRY
    ).unwrap();
}

/// Gather all metrics and return as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_registration_does_not_panic() {
        let metrics = gather_metrics();
        assert!(metrics.contains("requests_total"));
        assert!(metrics.contains("scheduler_outcomes_total"));
        assert!(metrics.contains("admission_queue_depth"));
    }
}
