//! Prometheus metrics exposition
//!
//! The host records:
//!
//! - `http_requests_total` (counter): labels `status`, `method`
//! - `http_request_duration_seconds` (histogram): label `status`
//!
//! The library crates add their own counters to the same recorder:
//! `auth_guard_decisions_total`, `oauth_token_refresh_total` and
//! `oauth_flow_events_total`.

use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Request latency buckets, 5ms up to the provider call ceiling.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("http_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("http_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Middleware timing every request.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    record_request(
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );
    response
}
