//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): upstream responses by method, status, backend
//! - `proxy_request_duration_seconds` (histogram): upstream latency per attempt
//! - `proxy_upstream_errors_total` (counter): transport failures by backend
//! - `proxy_retries_total` (counter): retries issued, by method

use std::net::SocketAddr;
use std::time::Instant;

use axum::http::Request;
use bytes::Bytes;
use metrics::{counter, histogram, Label};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::resilience::listener::RetryListener;

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record an upstream response.
pub fn record_request(method: &str, status: u16, backend: &str, start: Instant) {
    let labels = vec![
        Label::new("method", method.to_string()),
        Label::new("status", status.to_string()),
        Label::new("backend", backend.to_string()),
    ];
    counter!("proxy_requests_total", labels.clone()).increment(1);
    histogram!("proxy_request_duration_seconds", labels).record(start.elapsed().as_secs_f64());
}

/// Record a transport failure talking to `backend`.
pub fn record_upstream_error(backend: &str, kind: &'static str) {
    counter!(
        "proxy_upstream_errors_total",
        "backend" => backend.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Retry listener counting retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsRetryListener;

impl RetryListener for MetricsRetryListener {
    fn retried(&self, request: &Request<Bytes>, _attempt: u32) {
        counter!("proxy_retries_total", "method" => request.method().to_string()).increment(1);
    }
}
