//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router dispatching every request to the gateway handler
//! - Wire up middleware (tracing, request timeout, request ID)
//! - Compose forwarder and retry middleware from configuration
//! - Serve until the shutdown signal fires

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::Response,
    Router,
};
use axum::http::uri::InvalidUri;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ProxyConfig;
use crate::http::forward::Forwarder;
use crate::http::handler::Handler;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer};
use crate::http::stream;
use crate::observability::logging::LoggingRetryListener;
use crate::observability::metrics::MetricsRetryListener;
use crate::resilience::listener::RetryListeners;
use crate::resilience::retries::{Retry, RetryError};

/// Errors building the server from configuration.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid backend address: {0}")]
    Backend(#[from] InvalidUri),

    #[error(transparent)]
    Retry(#[from] RetryError),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<dyn Handler>,
}

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
}

impl HttpServer {
    /// Create a server forwarding to the configured backends with retries,
    /// reporting retries to the log and to metrics.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let listeners = RetryListeners::new()
            .with(LoggingRetryListener)
            .with(MetricsRetryListener);
        Self::with_listeners(config, listeners)
    }

    /// Like [`HttpServer::new`] with caller-supplied retry listeners.
    pub fn with_listeners(config: ProxyConfig, listeners: RetryListeners) -> Result<Self, ServerError> {
        let forwarder = Forwarder::from_config(&config)?;
        let listener_count = listeners.len();
        let retry = Retry::new(config.retries.attempts, forwarder, listeners)?
            .with_max_body_bytes(config.retries.max_body_bytes)?;

        tracing::debug!(
            attempts = retry.attempts(),
            backends = config.backends.len(),
            listeners = listener_count,
            "Gateway handler ready"
        );
        Ok(Self::from_handler(config, retry))
    }

    /// Serve `handler` behind the standard middleware stack.
    pub fn from_handler(config: ProxyConfig, handler: impl Handler) -> Self {
        let state = AppState {
            handler: Arc::new(handler),
        };
        let router = Self::build_router(&config, state);
        Self { router, config }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .fallback(gateway_handler)
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(propagate_request_id_layer())
            .layer(set_request_id_layer())
            .layer(TraceLayer::new_for_http())
    }

    /// The router, for embedding or in-process testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server, accepting connections until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            "HTTP server starting"
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

/// Hand the request to the gateway handler and stream its response.
async fn gateway_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    stream::serve(state.handler, request).await
}
