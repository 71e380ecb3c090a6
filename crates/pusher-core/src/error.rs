//! Error types for `Pusher` core library.

use thiserror::Error;

/// Result type alias using `Pusher` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Pusher` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Encoded data could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}
