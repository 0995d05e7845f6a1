//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware layers)
//!     → request.rs (request ID)
//!     → stream.rs (StreamingSink: the client-facing ResponseSink)
//!     → [retry middleware buffers each attempt] (resilience::retries)
//!     → forward.rs (pick backend, send upstream, stream back)
//!     → response.rs (hop-by-hop header hygiene)
//!     → Send to client
//! ```

pub mod forward;
pub mod handler;
pub mod request;
pub mod response;
pub mod server;
pub mod sink;
pub mod stream;

pub use forward::Forwarder;
pub use handler::Handler;
pub use request::{MakeRequestUuid, RequestIdExt, X_REQUEST_ID};
pub use server::HttpServer;
pub use sink::{CloseNotifier, MemorySink, ResponseSink};
pub use stream::StreamingSink;
