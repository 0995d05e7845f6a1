//! Buffering response recorder used by the retry middleware.
//!
//! # States
//! - Buffering: status, headers and body are held back and can be discarded
//! - Committed: everything buffered reached the real sink; writes pass through
//!
//! # State Transitions
//! ```text
//! Buffering → Committed: handler flushes, or the orchestrator commits
//! ```
//!
//! There is no way back. Once a byte reached the client the attempt is final.

use std::io;

use axum::http::{HeaderMap, StatusCode};
use bytes::BytesMut;
use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::http::sink::{CloseNotifier, ResponseSink};

/// Commit state of a recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Buffering,
    Committed,
}

/// State machine shared by both recorder variants.
struct Recording<'a> {
    sink: &'a mut dyn ResponseSink,
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    state: RecorderState,
}

impl<'a> Recording<'a> {
    fn new(sink: &'a mut dyn ResponseSink) -> Self {
        Self {
            sink,
            status: None,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            state: RecorderState::Buffering,
        }
    }

    fn write_head(&mut self, status: StatusCode) {
        match self.state {
            RecorderState::Buffering => self.status = Some(status),
            RecorderState::Committed => {
                tracing::debug!(%status, "Ignoring status written after commit");
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.state {
            RecorderState::Buffering => {
                self.status.get_or_insert(StatusCode::OK);
                self.body.extend_from_slice(buf);
                Ok(buf.len())
            }
            RecorderState::Committed => self.sink.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.state == RecorderState::Buffering {
            self.push_buffered()?;
        }
        self.sink.flush()
    }

    fn ready(&mut self) -> BoxFuture<'_, io::Result<()>> {
        match self.state {
            // Buffered bytes wait for the commit, not for the client.
            RecorderState::Buffering => Box::pin(async { Ok(()) }),
            RecorderState::Committed => self.sink.ready(),
        }
    }

    /// Hand status, headers and body to the real sink, in that order.
    fn push_buffered(&mut self) -> io::Result<()> {
        self.state = RecorderState::Committed;
        let status = self.status.take().unwrap_or(StatusCode::OK);
        self.sink.write_head(status);
        let sink_headers = self.sink.headers_mut();
        for (name, value) in self.headers.iter() {
            sink_headers.append(name.clone(), value.clone());
        }
        self.headers.clear();
        let body = self.body.split().freeze();
        if !body.is_empty() {
            self.sink.write(&body)?;
        }
        Ok(())
    }

    fn commit(&mut self) {
        if self.state == RecorderState::Committed {
            return;
        }
        if let Err(e) = self.push_buffered() {
            tracing::warn!(error = %e, "Failed to write buffered response");
        }
    }

    fn discard(&mut self) {
        debug_assert_eq!(self.state, RecorderState::Buffering);
        self.status = None;
        self.headers.clear();
        self.body.clear();
    }
}

/// Recorder over a sink without close notification.
pub struct RecorderWithoutCloseNotify<'a> {
    recording: Recording<'a>,
}

/// Recorder over a sink with close notification; re-exposes the sink's channel.
pub struct RecorderWithCloseNotify<'a> {
    recording: Recording<'a>,
    close: watch::Receiver<bool>,
}

impl CloseNotifier for RecorderWithCloseNotify<'_> {
    fn close_notify(&self) -> watch::Receiver<bool> {
        self.close.clone()
    }
}

/// Buffering wrapper around the real response sink.
///
/// The variant is chosen once, by probing the wrapped sink, so the recorder
/// advertises close notification exactly when the sink does.
pub enum ResponseRecorder<'a> {
    WithCloseNotify(RecorderWithCloseNotify<'a>),
    WithoutCloseNotify(RecorderWithoutCloseNotify<'a>),
}

impl<'a> ResponseRecorder<'a> {
    pub fn new(sink: &'a mut dyn ResponseSink) -> Self {
        let close = sink.as_close_notifier().map(|n| n.close_notify());
        match close {
            Some(close) => Self::WithCloseNotify(RecorderWithCloseNotify {
                recording: Recording::new(sink),
                close,
            }),
            None => Self::WithoutCloseNotify(RecorderWithoutCloseNotify {
                recording: Recording::new(sink),
            }),
        }
    }

    fn recording(&self) -> &Recording<'a> {
        match self {
            Self::WithCloseNotify(r) => &r.recording,
            Self::WithoutCloseNotify(r) => &r.recording,
        }
    }

    fn recording_mut(&mut self) -> &mut Recording<'a> {
        match self {
            Self::WithCloseNotify(r) => &mut r.recording,
            Self::WithoutCloseNotify(r) => &mut r.recording,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.recording().state
    }

    pub fn is_committed(&self) -> bool {
        self.state() == RecorderState::Committed
    }

    /// Buffered status, if any was written.
    pub fn status(&self) -> Option<StatusCode> {
        self.recording().status
    }

    /// Buffered body.
    pub fn body(&self) -> &[u8] {
        &self.recording().body
    }

    /// Deliver the buffered response to the real sink. No-op once committed.
    pub fn commit(&mut self) {
        self.recording_mut().commit();
    }

    /// Forget everything buffered so far. Must only be called while buffering.
    pub fn discard(&mut self) {
        self.recording_mut().discard();
    }
}

impl ResponseSink for ResponseRecorder<'_> {
    fn headers(&self) -> &HeaderMap {
        &self.recording().headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.recording_mut().headers
    }

    fn write_head(&mut self, status: StatusCode) {
        self.recording_mut().write_head(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.recording_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.recording_mut().flush()
    }

    fn ready(&mut self) -> BoxFuture<'_, io::Result<()>> {
        self.recording_mut().ready()
    }

    fn as_close_notifier(&self) -> Option<&dyn CloseNotifier> {
        match self {
            Self::WithCloseNotify(r) => Some(r),
            Self::WithoutCloseNotify(_) => None,
        }
    }
}
