//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use retry_gateway::config::{BackendConfig, ProxyConfig};
use retry_gateway::http::HttpServer;
use retry_gateway::lifecycle::Shutdown;
use retry_gateway::resilience::RetryListeners;
use tokio::net::TcpListener;

/// Serve `router` on an ephemeral port and return its address.
pub async fn spawn_backend(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// An address nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Gateway configuration forwarding to `backends` in order.
pub fn gateway_config(backends: &[SocketAddr], attempts: u32) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.observability.metrics_enabled = false;
    config.timeouts.upstream_secs = 2;
    config.retries.attempts = attempts;
    for (i, addr) in backends.iter().enumerate() {
        config.backends.push(BackendConfig {
            name: format!("b{}", i + 1),
            address: addr.to_string(),
        });
    }
    config
}

/// A running gateway; dropping it does not stop the server, call `stop`.
pub struct Gateway {
    pub addr: SocketAddr,
    shutdown: Shutdown,
}

impl Gateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    #[allow(dead_code)]
    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}

/// Start a gateway for `config` with the given retry listeners.
pub async fn spawn_gateway(config: ProxyConfig, listeners: RetryListeners) -> Gateway {
    let server = HttpServer::with_listeners(config, listeners).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    Gateway { addr, shutdown }
}

/// HTTP client that never reuses connections.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
