//! Response sinks.
//!
//! # Responsibilities
//! - Define the incremental response-writing contract handlers target
//! - Expose client-disconnect notification as an optional capability
//! - Provide an in-memory sink for tests and embedding
//!
//! # Design Decisions
//! - The head (status + headers) is emitted on the first `write` or `flush`,
//!   so headers may be changed freely until then
//! - Optional capabilities are probed through `as_close_notifier`, never
//!   assumed
//! - `write` and `flush` never block; writers producing an open-ended body
//!   await `ready` between chunks so a slow client pushes back on them

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::http::{HeaderMap, StatusCode};
use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::sync::watch;

/// Destination of an HTTP response written incrementally by a handler.
pub trait ResponseSink: Send {
    /// Headers that will be sent with the response head.
    fn headers(&self) -> &HeaderMap;

    /// Mutable access to the response headers.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Set the response status. Only the first call before the head is
    /// emitted has any effect.
    fn write_head(&mut self, status: StatusCode);

    /// Write body bytes. Emits the head with status 200 if no status was set.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Push everything written so far to the client.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Resolve once everything written so far has been handed on and the
    /// sink can take more.
    fn ready(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Probe for the close-notification capability.
    fn as_close_notifier(&self) -> Option<&dyn CloseNotifier> {
        None
    }
}

/// Capability of a sink to report that the client went away.
pub trait CloseNotifier {
    /// A channel whose value turns `true` once the client connection is gone.
    fn close_notify(&self) -> watch::Receiver<bool>;
}

/// What a [`MemorySink`] has received so far.
#[derive(Debug, Default, Clone)]
pub struct Recorded {
    /// Status of the emitted head, `None` until the head is emitted.
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: BytesMut,
    /// Number of `flush` calls.
    pub flushes: usize,
}

impl Recorded {
    pub fn body_bytes(&self) -> Bytes {
        self.body.clone().freeze()
    }
}

/// In-memory [`ResponseSink`].
///
/// Clones share the same recording, so a clone kept aside can inspect what
/// the sink received while a handler is still writing into it.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    recorded: Arc<Mutex<Recorded>>,
    pending_status: Option<StatusCode>,
    headers: HeaderMap,
    close: Option<watch::Receiver<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that advertises close notification through `close`.
    pub fn with_close_notify(close: watch::Receiver<bool>) -> Self {
        Self {
            close: Some(close),
            ..Self::default()
        }
    }

    /// Snapshot of everything received so far.
    pub fn recorded(&self) -> Recorded {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        // A poisoned recording is still readable; the panic surfaces elsewhere.
        self.recorded.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit_head(&mut self) {
        let headers = self.headers.clone();
        let status = self.pending_status.unwrap_or(StatusCode::OK);
        let mut recorded = self.lock();
        if recorded.status.is_none() {
            recorded.status = Some(status);
            recorded.headers = headers;
        }
    }
}

impl ResponseSink for MemorySink {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_head(&mut self, status: StatusCode) {
        if self.pending_status.is_none() {
            self.pending_status = Some(status);
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.emit_head();
        self.lock().body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_head();
        self.lock().flushes += 1;
        Ok(())
    }

    fn as_close_notifier(&self) -> Option<&dyn CloseNotifier> {
        match self.close {
            Some(_) => Some(self),
            None => None,
        }
    }
}

impl CloseNotifier for MemorySink {
    fn close_notify(&self) -> watch::Receiver<bool> {
        match &self.close {
            Some(rx) => rx.clone(),
            // Never exposed through `as_close_notifier` without a channel.
            None => watch::channel(false).1,
        }
    }
}
