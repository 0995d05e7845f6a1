//! Retry middleware.
//!
//! # Responsibilities
//! - Replay a request when the downstream transport reports a failure
//! - Keep failed attempts away from the client by buffering their output
//! - Give up retrying as soon as an attempt flushed bytes to the client
//!
//! # Design Decisions
//! - Only transport failures recorded through [`NetErrorRecorder`] are
//!   retried; an upstream 5xx is a valid answer and is passed on verbatim
//! - The request body is buffered once so every attempt can replay it
//! - The last attempt's response is committed whatever its outcome
//!
//! [`NetErrorRecorder`]: crate::resilience::net_error::NetErrorRecorder

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use thiserror::Error;

use crate::http::handler::Handler;
use crate::http::request::RequestIdExt;
use crate::http::sink::ResponseSink;
use crate::resilience::listener::RetryListener;
use crate::resilience::net_error::NetErrorSignal;
use crate::resilience::recorder::ResponseRecorder;

/// Default cap on the request body buffered for replay.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Construction errors of the retry middleware.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("retry attempts must be at least 1, got {0}")]
    InvalidAttempts(u32),

    #[error("retry body limit must be greater than zero")]
    InvalidBodyLimit,
}

/// Handler that re-issues requests to `next` on transport failures.
#[derive(Debug)]
pub struct Retry<H, L> {
    attempts: u32,
    max_body_bytes: usize,
    next: H,
    listener: L,
}

impl<H, L> Retry<H, L>
where
    H: Handler,
    L: RetryListener + 'static,
{
    /// Wrap `next` so every request gets up to `attempts` tries.
    pub fn new(attempts: u32, next: H, listener: L) -> Result<Self, RetryError> {
        if attempts < 1 {
            return Err(RetryError::InvalidAttempts(attempts));
        }
        Ok(Self {
            attempts,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            next,
            listener,
        })
    }

    /// Limit the request body buffered for replay.
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Result<Self, RetryError> {
        if max_body_bytes == 0 {
            return Err(RetryError::InvalidBodyLimit);
        }
        self.max_body_bytes = max_body_bytes;
        Ok(self)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    async fn run(&self, request: Request<Body>, sink: &mut dyn ResponseSink) {
        let (parts, body) = request.into_parts();
        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let status = if e.is::<LengthLimitError>() {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                tracing::warn!(error = %e, %status, "Could not buffer request body for replay");
                sink.write_head(status);
                return;
            }
        };
        let original = Request::from_parts(parts, body);
        let request_id = original.request_id().unwrap_or("unknown").to_string();

        for attempt in 1..=self.attempts {
            let signal = NetErrorSignal::new();
            let mut request = replay(&original);
            signal.bind(request.extensions_mut());

            let mut recorder = ResponseRecorder::new(&mut *sink);
            self.next.serve(request, &mut recorder).await;

            if recorder.is_committed() {
                tracing::debug!(
                    request_id = %request_id,
                    attempt,
                    "Response already streamed to client, not retrying"
                );
                return;
            }

            if signal.occurred() && attempt < self.attempts {
                tracing::debug!(
                    request_id = %request_id,
                    attempt,
                    max_attempts = self.attempts,
                    discarded_status = ?recorder.status(),
                    discarded_bytes = recorder.body().len(),
                    "Transport failure, retrying request"
                );
                self.listener.retried(&original, attempt);
                recorder.discard();
                continue;
            }

            recorder.commit();
            return;
        }
    }
}

impl<H, L> Handler for Retry<H, L>
where
    H: Handler,
    L: RetryListener + 'static,
{
    fn serve<'a>(
        &'a self,
        request: Request<Body>,
        sink: &'a mut dyn ResponseSink,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.run(request, sink))
    }
}

/// Fresh copy of the buffered request for one attempt.
fn replay(original: &Request<Bytes>) -> Request<Body> {
    let mut request = Request::new(Body::from(original.body().clone()));
    *request.method_mut() = original.method().clone();
    *request.uri_mut() = original.uri().clone();
    *request.version_mut() = original.version();
    *request.headers_mut() = original.headers().clone();
    *request.extensions_mut() = original.extensions().clone();
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::sink::MemorySink;
    use crate::resilience::listener::NoopRetryListener;
    use crate::resilience::net_error::{DefaultNetErrorRecorder, NetErrorRecorder};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records a transport failure and answers 502 on the listed calls,
    /// answers 200 otherwise.
    #[derive(Debug)]
    struct NetworkFailingHandler {
        fail_at_calls: Vec<u32>,
        calls: AtomicU32,
    }

    impl NetworkFailingHandler {
        fn new(fail_at_calls: Vec<u32>) -> Self {
            Self {
                fail_at_calls,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl Handler for NetworkFailingHandler {
        fn serve<'a>(
            &'a self,
            request: Request<Body>,
            sink: &'a mut dyn ResponseSink,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if self.fail_at_calls.contains(&call) {
                    DefaultNetErrorRecorder.record(request.extensions());
                    sink.write_head(StatusCode::BAD_GATEWAY);
                    sink.write(format!("attempt {call} failed").as_bytes()).unwrap();
                    return;
                }
                sink.write_head(StatusCode::OK);
                sink.write(format!("attempt {call} ok").as_bytes()).unwrap();
            })
        }
    }

    #[derive(Default)]
    struct CountingListener {
        attempts: Mutex<Vec<u32>>,
    }

    impl CountingListener {
        fn times_called(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }
    }

    impl RetryListener for CountingListener {
        fn retried(&self, _request: &Request<Bytes>, attempt: u32) {
            self.attempts.lock().unwrap().push(attempt);
        }
    }

    async fn run_retry<H: Handler>(
        attempts: u32,
        handler: H,
        listener: Arc<CountingListener>,
    ) -> MemorySink {
        let retry = Retry::new(attempts, handler, listener).unwrap();
        let mut sink = MemorySink::new();
        let request = Request::get("http://localhost:3000/ok")
            .body(Body::empty())
            .unwrap();
        retry.serve(request, &mut sink).await;
        sink.flush().unwrap();
        sink
    }

    #[tokio::test]
    async fn succeeds_after_transport_failures() {
        let listener = Arc::new(CountingListener::default());
        let handler = Arc::new(NetworkFailingHandler::new(vec![1, 2]));

        let sink = run_retry(3, handler.clone(), listener.clone()).await;

        let recorded = sink.recorded();
        assert_eq!(recorded.status, Some(StatusCode::OK));
        assert_eq!(recorded.body_bytes(), Bytes::from_static(b"attempt 3 ok"));
        assert_eq!(listener.times_called(), 2);
        assert_eq!(*listener.attempts.lock().unwrap(), vec![1, 2]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn last_attempt_is_committed_when_all_fail() {
        let listener = Arc::new(CountingListener::default());
        let handler = Arc::new(NetworkFailingHandler::new(vec![1, 2]));

        let sink = run_retry(2, handler.clone(), listener.clone()).await;

        let recorded = sink.recorded();
        assert_eq!(recorded.status, Some(StatusCode::BAD_GATEWAY));
        assert_eq!(recorded.body_bytes(), Bytes::from_static(b"attempt 2 failed"));
        assert_eq!(listener.times_called(), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_count_matches_failures_for_every_budget() {
        for attempts in 1..=4u32 {
            for failures in 0..attempts {
                let listener = Arc::new(CountingListener::default());
                let handler = Arc::new(NetworkFailingHandler::new((1..=failures).collect()));

                let sink = run_retry(attempts, handler.clone(), listener.clone()).await;

                let recorded = sink.recorded();
                assert_eq!(recorded.status, Some(StatusCode::OK), "A={attempts} k={failures}");
                assert_eq!(
                    recorded.body_bytes(),
                    Bytes::from(format!("attempt {} ok", failures + 1))
                );
                assert_eq!(listener.times_called(), failures as usize);
                assert_eq!(handler.calls.load(Ordering::SeqCst), failures + 1);
            }
        }
    }

    #[tokio::test]
    async fn application_errors_are_not_retried() {
        struct ServerError(AtomicU32);

        impl Handler for ServerError {
            fn serve<'a>(
                &'a self,
                _request: Request<Body>,
                sink: &'a mut dyn ResponseSink,
            ) -> BoxFuture<'a, ()> {
                Box::pin(async move {
                    self.0.fetch_add(1, Ordering::SeqCst);
                    sink.write_head(StatusCode::INTERNAL_SERVER_ERROR);
                    sink.write(b"boom").unwrap();
                })
            }
        }

        let listener = Arc::new(CountingListener::default());
        let handler = Arc::new(ServerError(AtomicU32::new(0)));

        let sink = run_retry(3, handler.clone(), listener.clone()).await;

        assert_eq!(sink.recorded().status, Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(listener.times_called(), 0);
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flush_makes_attempt_final() {
        /// Streams "FULL ", flushes, writes "DATA", then reports a transport
        /// failure that must be ignored.
        struct Streaming {
            calls: AtomicU32,
            observer: MemorySink,
        }

        impl Handler for Streaming {
            fn serve<'a>(
                &'a self,
                request: Request<Body>,
                sink: &'a mut dyn ResponseSink,
            ) -> BoxFuture<'a, ()> {
                Box::pin(async move {
                    self.calls.fetch_add(1, Ordering::SeqCst);
                    sink.write_head(StatusCode::OK);
                    sink.write(b"FULL ").unwrap();
                    assert!(self.observer.recorded().body.is_empty());

                    sink.flush().unwrap();
                    assert_eq!(
                        self.observer.recorded().body_bytes(),
                        Bytes::from_static(b"FULL ")
                    );

                    sink.write(b"DATA").unwrap();
                    DefaultNetErrorRecorder.record(request.extensions());
                })
            }
        }

        let mut sink = MemorySink::new();
        let handler = Arc::new(Streaming {
            calls: AtomicU32::new(0),
            observer: sink.clone(),
        });
        let listener = Arc::new(CountingListener::default());
        let retry = Retry::new(3, handler.clone(), listener.clone()).unwrap();

        retry
            .serve(Request::new(Body::empty()), &mut sink)
            .await;

        let recorded = sink.recorded();
        assert_eq!(recorded.status, Some(StatusCode::OK));
        assert_eq!(recorded.body_bytes(), Bytes::from_static(b"FULL DATA"));
        assert_eq!(recorded.flushes, 1);
        assert_eq!(listener.times_called(), 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flush_on_later_attempt_stops_there() {
        /// Fails transport-wise on the first call; on the second call it
        /// flushes and then fails again.
        struct FlushSecond(AtomicU32);

        impl Handler for FlushSecond {
            fn serve<'a>(
                &'a self,
                request: Request<Body>,
                sink: &'a mut dyn ResponseSink,
            ) -> BoxFuture<'a, ()> {
                Box::pin(async move {
                    let call = self.0.fetch_add(1, Ordering::SeqCst) + 1;
                    sink.write(format!("call {call}").as_bytes()).unwrap();
                    if call == 2 {
                        sink.flush().unwrap();
                    }
                    DefaultNetErrorRecorder.record(request.extensions());
                })
            }
        }

        let listener = Arc::new(CountingListener::default());
        let handler = Arc::new(FlushSecond(AtomicU32::new(0)));

        let sink = run_retry(5, handler.clone(), listener.clone()).await;

        assert_eq!(sink.recorded().body_bytes(), Bytes::from_static(b"call 2"));
        assert_eq!(handler.0.load(Ordering::SeqCst), 2);
        assert_eq!(listener.times_called(), 1);
    }

    #[tokio::test]
    async fn failed_attempt_headers_do_not_leak() {
        struct HeaderPerAttempt(AtomicU32);

        impl Handler for HeaderPerAttempt {
            fn serve<'a>(
                &'a self,
                request: Request<Body>,
                sink: &'a mut dyn ResponseSink,
            ) -> BoxFuture<'a, ()> {
                Box::pin(async move {
                    let call = self.0.fetch_add(1, Ordering::SeqCst) + 1;
                    if call == 1 {
                        sink.headers_mut().insert("x-failed", "1".parse().unwrap());
                        DefaultNetErrorRecorder.record(request.extensions());
                    } else {
                        sink.headers_mut().insert("x-served", "2".parse().unwrap());
                    }
                })
            }
        }

        let sink = run_retry(
            2,
            HeaderPerAttempt(AtomicU32::new(0)),
            Arc::new(CountingListener::default()),
        )
        .await;

        let recorded = sink.recorded();
        assert!(recorded.headers.get("x-failed").is_none());
        assert_eq!(recorded.headers["x-served"], "2");
    }

    #[tokio::test]
    async fn request_body_is_replayed_on_every_attempt() {
        struct EchoBody {
            seen: Mutex<Vec<Bytes>>,
        }

        impl Handler for EchoBody {
            fn serve<'a>(
                &'a self,
                request: Request<Body>,
                _sink: &'a mut dyn ResponseSink,
            ) -> BoxFuture<'a, ()> {
                Box::pin(async move {
                    let extensions = request.extensions().clone();
                    let body = request.into_body().collect().await.unwrap().to_bytes();
                    let mut seen = self.seen.lock().unwrap();
                    seen.push(body);
                    if seen.len() == 1 {
                        DefaultNetErrorRecorder.record(&extensions);
                    }
                })
            }
        }

        let handler = Arc::new(EchoBody {
            seen: Mutex::new(Vec::new()),
        });
        let retry = Retry::new(2, handler.clone(), NoopRetryListener).unwrap();
        let request = Request::post("/orders")
            .header("x-request-id", "abc")
            .body(Body::from("payload"))
            .unwrap();

        retry.serve(request, &mut MemorySink::new()).await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|b| b == &Bytes::from_static(b"payload")));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_without_calling_handler() {
        let handler = Arc::new(NetworkFailingHandler::new(vec![]));
        let retry = Retry::new(2, handler.clone(), NoopRetryListener)
            .unwrap()
            .with_max_body_bytes(4)
            .unwrap();
        let mut sink = MemorySink::new();

        retry
            .serve(Request::new(Body::from("too large")), &mut sink)
            .await;
        sink.flush().unwrap();

        assert_eq!(sink.recorded().status, Some(StatusCode::PAYLOAD_TOO_LARGE));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let handler = NetworkFailingHandler::new(vec![]);
        let err = Retry::new(0, handler, NoopRetryListener).unwrap_err();
        assert_eq!(err, RetryError::InvalidAttempts(0));
    }

    #[test]
    fn zero_body_limit_is_rejected() {
        let handler = NetworkFailingHandler::new(vec![]);
        let err = Retry::new(1, handler, NoopRetryListener)
            .unwrap()
            .with_max_body_bytes(0)
            .unwrap_err();
        assert_eq!(err, RetryError::InvalidBodyLimit);
    }
}
