//! Upstream forwarding.
//!
//! # Responsibilities
//! - Pick a backend per attempt (round-robin)
//! - Rewrite the request URI and strip hop-by-hop headers
//! - Stream the upstream response into the sink
//! - Report transport failures through the request's net error slot
//!
//! # Design Decisions
//! - The forwarder knows nothing about retries; it only records failures
//! - Dial errors, upstream timeouts and broken upstream bodies are
//!   transport failures; any status the upstream sends is not
//! - Server-sent events are flushed frame by frame, which makes them final
//! - Every frame waits for `ResponseSink::ready`, so a slow client slows the
//!   upstream read instead of queueing
//! - The attempt is abandoned as soon as the client goes away

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::uri::{InvalidUri, PathAndQuery, Scheme};
use axum::http::{header, Extensions, HeaderMap, Request, Response, StatusCode, Uri, Version};
use futures_util::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use tokio::sync::watch;

use crate::config::{ProxyConfig, TimeoutConfig};
use crate::http::handler::Handler;
use crate::http::request::RequestIdExt;
use crate::http::response::strip_hop_by_hop;
use crate::http::sink::ResponseSink;
use crate::load_balancer::{LoadBalancer, backend::Backend, round_robin::RoundRobin};
use crate::observability::metrics;
use crate::resilience::net_error::{DefaultNetErrorRecorder, NetErrorRecorder};

/// Reverse-proxy handler sending each request to one backend.
pub struct Forwarder {
    backends: Vec<Arc<Backend>>,
    balancer: Box<dyn LoadBalancer>,
    client: Client<HttpConnector, Body>,
    upstream_timeout: Duration,
    net_errors: Arc<dyn NetErrorRecorder>,
}

impl Forwarder {
    /// Create a forwarder over `backends`.
    pub fn new(backends: Vec<Arc<Backend>>, timeouts: &TimeoutConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(timeouts.connect_secs)));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            backends,
            balancer: Box::new(RoundRobin::new()),
            client,
            upstream_timeout: Duration::from_secs(timeouts.upstream_secs),
            net_errors: Arc::new(DefaultNetErrorRecorder),
        }
    }

    /// Create a forwarder from the configured backends.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, InvalidUri> {
        let backends = config
            .backends
            .iter()
            .map(|b| Backend::new(b.name.as_str(), &b.address).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(backends, &config.timeouts))
    }

    /// Replace the recorder used to report transport failures.
    pub fn with_net_error_recorder(mut self, recorder: impl NetErrorRecorder + 'static) -> Self {
        self.net_errors = Arc::new(recorder);
        self
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    fn transport_failure(
        &self,
        extensions: &Extensions,
        backend: &Backend,
        kind: &'static str,
        sink: &mut dyn ResponseSink,
        status: StatusCode,
    ) {
        self.net_errors.record(extensions);
        metrics::record_upstream_error(&backend.name, kind);
        sink.write_head(status);
        if let Some(reason) = status.canonical_reason() {
            let _ = sink.write(reason.as_bytes());
        }
    }

    async fn forward(&self, request: Request<Body>, sink: &mut dyn ResponseSink) {
        let start = Instant::now();
        let request_id = request.request_id().unwrap_or("unknown").to_string();
        let method = request.method().to_string();

        let Some(backend) = self.balancer.next_server(&self.backends) else {
            tracing::warn!(request_id = %request_id, "No backends configured");
            sink.write_head(StatusCode::SERVICE_UNAVAILABLE);
            let _ = sink.write(b"No backends available");
            return;
        };

        let extensions = request.extensions().clone();
        let (mut parts, body) = request.into_parts();
        parts.uri = match upstream_uri(&parts.uri, &backend) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "Could not build upstream URI");
                sink.write_head(StatusCode::BAD_REQUEST);
                return;
            }
        };
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);

        tracing::debug!(
            request_id = %request_id,
            backend = %backend.name,
            uri = %parts.uri,
            "Forwarding request"
        );

        let mut closed = sink.as_close_notifier().map(|n| n.close_notify());
        let upstream = self.client.request(Request::from_parts(parts, body));
        let upstream = tokio::select! {
            _ = client_gone(&mut closed) => {
                tracing::debug!(request_id = %request_id, "Client went away before upstream answered");
                return;
            }
            result = tokio::time::timeout(self.upstream_timeout, upstream) => result,
        };
        let response: Response<Incoming> = match upstream {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let kind = if e.is_connect() { "connect" } else { "request" };
                tracing::warn!(
                    request_id = %request_id,
                    backend = %backend.name,
                    error = %e,
                    kind,
                    "Upstream error"
                );
                self.transport_failure(&extensions, &backend, kind, sink, StatusCode::BAD_GATEWAY);
                return;
            }
            Err(_) => {
                tracing::warn!(
                    request_id = %request_id,
                    backend = %backend.name,
                    timeout = ?self.upstream_timeout,
                    "Upstream timed out"
                );
                self.transport_failure(&extensions, &backend, "timeout", sink, StatusCode::GATEWAY_TIMEOUT);
                return;
            }
        };

        let (mut parts, mut body) = response.into_parts();
        metrics::record_request(&method, parts.status.as_u16(), &backend.name, start);
        strip_hop_by_hop(&mut parts.headers);
        let streaming = is_event_stream(&parts.headers);

        sink.write_head(parts.status);
        sink.headers_mut().extend(parts.headers);

        loop {
            let frame = tokio::select! {
                _ = client_gone(&mut closed) => {
                    tracing::debug!(request_id = %request_id, "Client went away mid-response");
                    return;
                }
                frame = body.frame() => frame,
            };
            let Some(frame) = frame else {
                break;
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(
                        request_id = %request_id,
                        backend = %backend.name,
                        error = %e,
                        "Upstream body failed mid-response"
                    );
                    self.net_errors.record(&extensions);
                    metrics::record_upstream_error(&backend.name, "body");
                    return;
                }
            };
            let Ok(data) = frame.into_data() else {
                continue;
            };
            let written = sink.write(&data).and_then(|_| {
                if streaming {
                    sink.flush()
                } else {
                    Ok(())
                }
            });
            if let Err(e) = written {
                tracing::debug!(request_id = %request_id, error = %e, "Client went away");
                return;
            }
            if let Err(e) = sink.ready().await {
                tracing::debug!(request_id = %request_id, error = %e, "Client went away");
                return;
            }
        }
    }
}

impl Handler for Forwarder {
    fn serve<'a>(
        &'a self,
        request: Request<Body>,
        sink: &'a mut dyn ResponseSink,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.forward(request, sink))
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("backends", &self.backends)
            .field("balancer", &self.balancer)
            .field("upstream_timeout", &self.upstream_timeout)
            .finish_non_exhaustive()
    }
}

fn upstream_uri(uri: &Uri, backend: &Backend) -> Result<Uri, axum::http::Error> {
    let path_and_query = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(backend.authority.clone())
        .path_and_query(path_and_query)
        .build()
}

/// Resolve once the client is known to be gone; never without a notifier.
async fn client_gone(closed: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = closed {
        let gone = rx.wait_for(|gone| *gone).await.is_ok();
        if gone {
            return;
        }
    }
    std::future::pending::<()>().await
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}
