//! # Session Error Types

use thiserror::Error;

/// Errors surfaced by the playback session controller.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The media source type is unsupported or unresolvable.
    ///
    /// Raised synchronously at session creation.
    #[error("Unsupported media source: {0}")]
    Construction(String),

    /// The playback engine rejected an operation.
    #[error("Engine error: {0}")]
    Engine(String),

    /// The cache layer failed.
    #[error("Cache error: {0}")]
    Cache(#[from] core_cache::CacheError),

    /// The session has been disposed; no further operations are possible.
    #[error("Session already disposed")]
    Disposed,
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
