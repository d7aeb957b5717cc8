//! Prometheus metrics exposition
//!
//! HTTP-level metrics are recorded here; flow outcomes are recorded by the
//! `oauth-flow` crate through the same global recorder.
//!
//! - `http_requests_total` (counter): labels `status`, `method`
//! - `http_request_duration_seconds` (histogram): label `status`
//! - `oauth_authorizations_requested_total` (counter)
//! - `oauth_callbacks_total` (counter): label `outcome`
//! - `oauth_status_checks_total` (counter): label `status`
//! - `oauth_token_refreshes_total` (counter): label `outcome`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("http_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Request durations render as a histogram with `_bucket` lines (5 ms to
/// 60 s, covering the token endpoint timeout) rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed HTTP request with status code and method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("http_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("http_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}
