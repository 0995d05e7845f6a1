//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request enters retries.rs (Retry)
//!     → net_error.rs (fresh NetErrorSignal bound into the request extensions)
//!     → recorder.rs (ResponseRecorder buffers the attempt's response)
//!     → downstream handler runs, transport code may record a net error
//!     → retry: listener.rs notifies RetryListeners, next attempt
//!     → otherwise: recorder commits to the client
//! ```
//!
//! # Design Decisions
//! - Only transport failures are retried, never response statuses
//! - A flushed attempt is final; the client already has its bytes
//! - Attempts are strictly sequential

pub mod listener;
pub mod net_error;
pub mod recorder;
pub mod retries;

pub use listener::{NoopRetryListener, RetryListener, RetryListeners};
pub use net_error::{record_net_error, DefaultNetErrorRecorder, NetErrorRecorder, NetErrorSignal};
pub use recorder::{RecorderState, ResponseRecorder};
pub use retries::{Retry, RetryError};
