use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client.
///
/// Every variant carries a human-readable message; variants wrapping a lower
/// layer keep the cause attached as a `source`.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid host, port, dialect or client option.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Proxy handshake failure: protocol violation, unexpected reply byte,
    /// authentication rejection, DNS failure or a timeout waiting for the
    /// proxy to answer.
    #[error("proxy error: {message}")]
    Proxy {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// Malformed HTTP received over the tunnel: bad status line, bad header
    /// line or an invalid chunk header.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No pooled connection became free within the configured wait.
    #[error("timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    /// Transport-level I/O failure.
    #[error("i/o error")]
    Io(#[from] io::Error),

    /// The caller's cancellation token fired, or the owning client was
    /// closed while the operation was in flight.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn proxy(message: impl Into<String>) -> Self {
        Error::Proxy {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn proxy_io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Proxy {
            message: message.into(),
            source: Some(source),
        }
    }
}
