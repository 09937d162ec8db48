//! Error types for relaykit

use thiserror::Error;

/// Main error type for relaykit
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Mux error: {0}")]
    Mux(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Terminal listener error: no further connections will be produced.
    #[error("Listener closed")]
    Closed,

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

impl Error {
    /// Whether this error ends a listener's accept sequence.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::Timeout => std::io::Error::new(std::io::ErrorKind::TimedOut, e.to_string()),
            Error::Closed => std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()),
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Result type alias for relaykit
pub type Result<T> = std::result::Result<T, Error>;
