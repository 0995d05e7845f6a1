//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt starts in the forwarder
//!     → round_robin.rs (rotate through backends)
//!     → backend.rs (address to forward to)
//! ```
//!
//! # Design Decisions
//! - Selection happens per attempt, so a retried request moves on to the
//!   next backend instead of hammering the one that just failed

pub mod backend;
pub mod round_robin;

use std::sync::Arc;

use backend::Backend;

/// Strategy picking the backend for the next attempt.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;
}
