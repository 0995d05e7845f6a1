//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Log retry decisions with the request ID
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - Log level configurable via config, `RUST_LOG` wins when set

use axum::http::Request;
use bytes::Bytes;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::http::request::RequestIdExt;
use crate::resilience::listener::RetryListener;

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(config: &ObservabilityConfig) -> String {
    format!(
        "retry_gateway={level},tower_http={level}",
        level = config.log_level
    )
}

/// Install the global tracing subscriber.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config)));

    // A subscriber may already be installed, e.g. by a test harness.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Retry listener emitting one log event per retry.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRetryListener;

impl RetryListener for LoggingRetryListener {
    fn retried(&self, request: &Request<Bytes>, attempt: u32) {
        tracing::info!(
            request_id = request.request_id().unwrap_or("unknown"),
            method = %request.method(),
            uri = %request.uri(),
            failed_attempt = attempt,
            next_attempt = attempt + 1,
            "Retrying request after transport failure"
        );
    }
}
