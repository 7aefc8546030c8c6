//! Error taxonomy shared by the transport, gateways and the reconciliation loop.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum Error {
    /// Unsupported mode combination or unusable configuration.
    /// Always raised before any network call.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Transport-level failure. Retryable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Backend rejected the request (bad payload, auth failure). Not retried.
    #[error("Application error (status {status:?}): {message}")]
    Application {
        status: Option<u16>,
        message: String,
    },

    /// Backend answered with a payload we could not decode.
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Image codec error: {0}")]
    Codec(String),

    /// Operator-requested cancellation. Never swallowed.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn application(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Application {
            status,
            message: message.into(),
        }
    }

    /// Whether the retry policy may try the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
