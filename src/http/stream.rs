//! Client-facing response sink.
//!
//! # Data Flow
//! ```text
//! handler task ── write/flush ──▶ StreamingSink
//!     → head (status + headers) over a oneshot, sent on first write/flush
//!     → body chunks over a bounded channel
//!     → axum Body streamed to the client by hyper
//! ```
//!
//! # Design Decisions
//! - The handler runs in its own task; it is stalled only through `ready`
//! - At most `BODY_CHANNEL_CAPACITY` chunks plus what was written since the
//!   last `ready` are held for a slow client
//! - Close notification flips once hyper drops the response body
//! - A handler that ends without writing still produces a head (200 default)

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::stream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use crate::http::handler::Handler;
use crate::http::sink::{CloseNotifier, ResponseSink};

type Chunk = Result<Bytes, io::Error>;

/// Body chunks queued between the handler task and hyper.
pub const BODY_CHANNEL_CAPACITY: usize = 8;

struct Head {
    status: StatusCode,
    headers: HeaderMap,
}

/// [`ResponseSink`] feeding an axum response body.
pub struct StreamingSink {
    status: Option<StatusCode>,
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<Head>>,
    body_tx: mpsc::Sender<Chunk>,
    // Written but not yet queued because the channel was full.
    staged: BytesMut,
    close_rx: watch::Receiver<bool>,
    // Dropping this ends the close watcher task.
    _done: oneshot::Sender<()>,
}

/// Receiving half of a [`StreamingSink`].
pub struct PendingResponse {
    head_rx: oneshot::Receiver<Head>,
    body_rx: mpsc::Receiver<Chunk>,
}

impl StreamingSink {
    /// Create a sink and the pending response it feeds.
    ///
    /// Must be called within a Tokio runtime.
    pub fn channel() -> (Self, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let watched = body_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watched.closed() => {
                    let _ = close_tx.send(true);
                }
                _ = done_rx => {}
            }
        });

        let sink = Self {
            status: None,
            headers: HeaderMap::new(),
            head_tx: Some(head_tx),
            body_tx,
            staged: BytesMut::new(),
            close_rx,
            _done: done_tx,
        };
        (sink, PendingResponse { head_rx, body_rx })
    }

    fn emit_head(&mut self) {
        if let Some(head_tx) = self.head_tx.take() {
            let head = Head {
                status: self.status.unwrap_or(StatusCode::OK),
                headers: std::mem::take(&mut self.headers),
            };
            // A dropped receiver means the client is gone; writes will report it.
            let _ = head_tx.send(head);
        }
    }

    /// Queue staged bytes if the channel has room right now.
    fn try_drain(&mut self) -> io::Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        match self.body_tx.try_reserve() {
            Ok(permit) => {
                permit.send(Ok(self.staged.split().freeze()));
                Ok(())
            }
            Err(TrySendError::Full(())) => Ok(()),
            Err(TrySendError::Closed(())) => Err(client_gone()),
        }
    }

    /// Emit the head if nothing was written, deliver staged bytes and end
    /// the body.
    pub async fn finish(mut self) {
        self.emit_head();
        if !self.staged.is_empty() {
            let chunk = self.staged.split().freeze();
            let _ = self.body_tx.send(Ok(chunk)).await;
        }
    }
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
}

impl ResponseSink for StreamingSink {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_head(&mut self, status: StatusCode) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.emit_head();
        if buf.is_empty() {
            return Ok(0);
        }
        if self.body_tx.is_closed() {
            return Err(client_gone());
        }
        self.staged.extend_from_slice(buf);
        self.try_drain()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_head();
        if self.body_tx.is_closed() {
            return Err(client_gone());
        }
        self.try_drain()
    }

    fn ready(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.emit_head();
            if !self.staged.is_empty() {
                let chunk = self.staged.split().freeze();
                self.body_tx.send(Ok(chunk)).await.map_err(|_| client_gone())?;
            }
            // Wait for room without holding on to it.
            self.body_tx.reserve().await.map(drop).map_err(|_| client_gone())
        })
    }

    fn as_close_notifier(&self) -> Option<&dyn CloseNotifier> {
        Some(self)
    }
}

impl CloseNotifier for StreamingSink {
    fn close_notify(&self) -> watch::Receiver<bool> {
        self.close_rx.clone()
    }
}

impl PendingResponse {
    /// Wait for the head and turn it into a streaming response.
    pub async fn into_response(self) -> Response {
        let Ok(head) = self.head_rx.await else {
            tracing::error!("Handler ended without producing a response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };

        let mut body_rx = self.body_rx;
        let body = Body::from_stream(stream::poll_fn(move |cx| body_rx.poll_recv(cx)));
        let mut response = Response::new(body);
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        response
    }
}

/// Run `handler` for `request` in its own task and stream what it writes.
pub async fn serve<H: Handler + ?Sized>(handler: Arc<H>, request: Request<Body>) -> Response {
    let (mut sink, pending) = StreamingSink::channel();
    tokio::spawn(async move {
        handler.serve(request, &mut sink).await;
        sink.finish().await;
    });
    pending.into_response().await
}
