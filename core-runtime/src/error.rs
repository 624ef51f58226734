//! Runtime infrastructure errors.

use thiserror::Error;

/// Errors raised by runtime infrastructure (logging, configuration).
#[derive(Error, Debug)]
pub enum Error {
    /// Logging initialization failed (already initialized, bad filter, ...).
    #[error("Logging initialization failed: {0}")]
    LoggingInit(String),

    /// A configuration value failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;
