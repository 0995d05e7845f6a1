//! Retry observers.

use std::sync::Arc;

use axum::http::Request;
use bytes::Bytes;

/// Notified every time the retry middleware re-issues a request.
pub trait RetryListener: Send + Sync {
    /// `attempt` is the 1-based attempt that just failed; attempt
    /// `attempt + 1` starts right after this returns.
    fn retried(&self, request: &Request<Bytes>, attempt: u32);
}

impl<L: RetryListener + ?Sized> RetryListener for Arc<L> {
    fn retried(&self, request: &Request<Bytes>, attempt: u32) {
        (**self).retried(request, attempt)
    }
}

/// Listener that ignores every retry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRetryListener;

impl RetryListener for NoopRetryListener {
    fn retried(&self, _request: &Request<Bytes>, _attempt: u32) {}
}

/// Fans a retry event out to every registered listener, in registration order.
#[derive(Default, Clone)]
pub struct RetryListeners(Vec<Arc<dyn RetryListener>>);

impl RetryListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, listener: impl RetryListener + 'static) {
        self.0.push(Arc::new(listener));
    }

    pub fn with(mut self, listener: impl RetryListener + 'static) -> Self {
        self.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl RetryListener for RetryListeners {
    fn retried(&self, request: &Request<Bytes>, attempt: u32) {
        for listener in &self.0 {
            listener.retried(request, attempt);
        }
    }
}

impl std::fmt::Debug for RetryListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryListeners")
            .field("len", &self.len())
            .finish()
    }
}
