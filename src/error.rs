//! Error types for relayscore.

use std::io;

use thiserror::Error;

/// Result type alias for relayscore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for relayscore.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no tokio runtime available for {0}")]
    NoRuntime(&'static str),

    #[error("latency service has shut down")]
    ServiceClosed,
}

impl Error {
    /// Whether this error means probing can continue with another transport.
    pub fn allows_fallback(&self) -> bool {
        matches!(self, Error::Socket(_) | Error::Io(_))
    }
}
