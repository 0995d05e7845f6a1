//! Backend abstraction.

use std::str::FromStr;

use axum::http::uri::{Authority, InvalidUri};

/// A single upstream server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// Name used in logs and metrics.
    pub name: String,
    /// `host:port` requests are forwarded to.
    pub authority: Authority,
}

impl Backend {
    /// Create a backend from its configured name and address.
    pub fn new(name: impl Into<String>, address: &str) -> Result<Self, InvalidUri> {
        Ok(Self {
            name: name.into(),
            authority: Authority::from_str(address)?,
        })
    }
}
