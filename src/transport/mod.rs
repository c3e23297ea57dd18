//! Pluggable transport layer: filesystem rendezvous and TCP connections, per
//! `spec.md` §4.2/§4.3.

pub mod fs;
pub mod tcp;

use std::fmt;

/// Errors raised by either transport.
#[derive(Debug)]
pub enum TransportError {
    /// Bind/listen failure at startup.
    Bind(std::io::Error),
    /// A send attempt failed; the router should try the other transport and
    /// increment the peer's failure counter.
    SendFailed(String),
    /// Underlying I/O failure not covered by a more specific variant.
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(err) => write!(f, "transport bind error: {err}"),
            Self::SendFailed(err) => write!(f, "transport send failed: {err}"),
            Self::Io(err) => write!(f, "transport I/O error: {err}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
