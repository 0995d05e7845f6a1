//! Out-of-band reporting of transport failures.
//!
//! The retry middleware installs a fresh flag into the request extensions
//! for every attempt. Transport code deep inside a handler reports a failed
//! dial or a broken upstream connection through [`NetErrorRecorder::record`]
//! without knowing whether a retry middleware is present at all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use axum::http::Extensions;

/// Extension key, private to this module.
#[derive(Clone)]
struct NetErrorSlot(Weak<AtomicBool>);

/// Per-attempt transport failure flag owned by the retry middleware.
#[derive(Debug, Default)]
pub struct NetErrorSignal {
    occurred: Arc<AtomicBool>,
}

impl NetErrorSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make this signal reachable from `extensions`, replacing any slot a
    /// previous attempt left behind.
    pub fn bind(&self, extensions: &mut Extensions) {
        extensions.insert(NetErrorSlot(Arc::downgrade(&self.occurred)));
    }

    /// Whether a transport failure was recorded for this attempt.
    pub fn occurred(&self) -> bool {
        self.occurred.load(Ordering::Acquire)
    }
}

/// Reports transport failures for the request that owns `extensions`.
pub trait NetErrorRecorder: Send + Sync {
    fn record(&self, extensions: &Extensions);
}

/// Recorder writing into the slot installed by [`NetErrorSignal::bind`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNetErrorRecorder;

impl NetErrorRecorder for DefaultNetErrorRecorder {
    fn record(&self, extensions: &Extensions) {
        record_net_error(extensions);
    }
}

/// Flag a transport failure on the current attempt, if there is one.
///
/// No-op when the extensions carry no slot or the owning attempt is over.
pub fn record_net_error(extensions: &Extensions) {
    if let Some(flag) = extensions.get::<NetErrorSlot>().and_then(|slot| slot.0.upgrade()) {
        flag.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sets_bound_flag() {
        let signal = NetErrorSignal::new();
        let mut extensions = Extensions::new();
        signal.bind(&mut extensions);

        assert!(!signal.occurred());
        DefaultNetErrorRecorder.record(&extensions);
        assert!(signal.occurred());

        // Idempotent.
        DefaultNetErrorRecorder.record(&extensions);
        assert!(signal.occurred());
    }

    #[test]
    fn record_without_slot_is_noop() {
        let extensions = Extensions::new();
        DefaultNetErrorRecorder.record(&extensions);
    }

    #[test]
    fn record_ignores_foreign_flag() {
        let foreign = Arc::new(AtomicBool::new(false));
        let mut extensions = Extensions::new();
        extensions.insert(foreign.clone());
        extensions.insert(String::from("nonsense"));

        DefaultNetErrorRecorder.record(&extensions);

        assert!(!foreign.load(Ordering::SeqCst));
        assert_eq!(extensions.get::<String>().map(String::as_str), Some("nonsense"));
    }

    #[test]
    fn record_after_attempt_ended_is_noop() {
        let mut extensions = Extensions::new();
        {
            let signal = NetErrorSignal::new();
            signal.bind(&mut extensions);
        }
        DefaultNetErrorRecorder.record(&extensions);
    }

    #[test]
    fn rebinding_isolates_attempts() {
        let mut extensions = Extensions::new();
        let first = NetErrorSignal::new();
        first.bind(&mut extensions);
        let stale = extensions.clone();

        let second = NetErrorSignal::new();
        second.bind(&mut extensions);
        DefaultNetErrorRecorder.record(&extensions);

        assert!(!first.occurred());
        assert!(second.occurred());

        // A clone taken during the first attempt only reaches the first flag.
        DefaultNetErrorRecorder.record(&stale);
        assert!(first.occurred());
    }

    #[tokio::test]
    async fn record_from_joined_task_is_visible() {
        let signal = NetErrorSignal::new();
        let mut extensions = Extensions::new();
        signal.bind(&mut extensions);

        let task = tokio::spawn(async move {
            record_net_error(&extensions);
        });
        task.await.unwrap();

        assert!(signal.occurred());
    }
}
