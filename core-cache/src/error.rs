//! # Cache Error Types
//!
//! Error types for the cache store, origin fetcher, and proxy server.

use thiserror::Error;

/// Errors that can occur in cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    // ========================================================================
    // Store Errors
    // ========================================================================
    /// Cache storage has not been initialized.
    #[error("Cache storage not initialized")]
    NotInitialized,

    /// A non-sequential write was attempted against a cache entry.
    ///
    /// Fatal to the entry: the on-disk file can no longer be trusted to be
    /// hole-free, so every reader of the entry fails.
    #[error("Non-sequential cache write: expected offset {expected}, got {got}")]
    StoreInconsistency { expected: u64, got: u64 },

    /// A write was attempted against an entry already marked complete.
    #[error("Cache entry is already complete")]
    EntryComplete,

    // ========================================================================
    // Fetch Errors
    // ========================================================================
    /// Transient network failure (connect, timeout, dropped body).
    #[error("Network error: {0}")]
    Network(String),

    /// Origin answered with a non-success status other than 403.
    #[error("Origin request failed with status {status}")]
    Fetch { status: u16 },

    /// Origin answered 403 for this resource.
    #[error("Origin denied access (403)")]
    Forbidden,

    /// The entry already failed terminally; carries the recorded failure.
    #[error("Cache entry failed: {0}")]
    Failed(FetchFailure),

    // ========================================================================
    // Generic Errors
    // ========================================================================
    /// I/O error from the backing storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not occur in normal operation).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Returns `true` if the operation can be retried after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Network(_))
    }

    /// Returns `true` if this is an authorization failure.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, CacheError::Forbidden)
            || matches!(self, CacheError::Failed(f) if f.is_forbidden())
    }
}

/// Terminal failure recorded on a cache entry and fanned out to every
/// current and future reader, and to cache listeners.
///
/// Kept separate from [`CacheError`] so it can be cloned into each waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// Origin answered 403.
    Forbidden,
    /// Origin answered another non-success status.
    Fetch { status: u16 },
    /// Transport failure that exhausted the retry policy.
    Network(String),
    /// The backing store failed (inconsistent write or I/O).
    Store(String),
}

impl FetchFailure {
    /// Listener-visible error code distinguishing authorization failures
    /// from generic ones.
    pub fn error_code(&self) -> &'static str {
        match self {
            FetchFailure::Forbidden => "403",
            FetchFailure::Fetch { .. } => "FetchError",
            FetchFailure::Network(_) => "NetworkError",
            FetchFailure::Store(_) => "StoreError",
        }
    }

    /// Returns `true` if this is an authorization failure.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, FetchFailure::Forbidden)
    }
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchFailure::Forbidden => write!(f, "origin denied access (403)"),
            FetchFailure::Fetch { status } => write!(f, "origin request failed with status {status}"),
            FetchFailure::Network(msg) => write!(f, "network failure: {msg}"),
            FetchFailure::Store(msg) => write!(f, "store failure: {msg}"),
        }
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
