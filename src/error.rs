//! Error types for the Bouncer service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Bouncer operations.
#[derive(Error, Debug)]
pub enum BouncerError {
    /// Invalid or unreadable configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors that could not be absorbed by the failure policy
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for BouncerError {
    fn from(err: ::config::ConfigError) -> Self {
        BouncerError::Config(err.to_string())
    }
}

/// Failure of a single counter store call.
///
/// Inside the admission path these never propagate: the failure policy turns
/// them into a decision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network, protocol or server-side failure
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the configured bound
    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for Bouncer operations.
pub type Result<T> = std::result::Result<T, BouncerError>;
