//! Retry Gateway Library
//!
//! Reverse proxy that replays a request against its backends when an attempt
//! fails at the transport level, while streaming the final attempt's
//! response to the client unchanged.

pub mod config;
pub mod http;
pub mod load_balancer;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use resilience::{NetErrorSignal, ResponseRecorder, Retry, RetryListener, RetryListeners};
