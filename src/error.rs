//! Error types for the Floodgate service.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors, raised while building a limiter or
    /// middleware stack. These are fatal: nothing is constructed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while evaluating a limit against its store.
    #[error("Evaluation error: {0}")]
    Evaluation(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
