//! # Logging & Tracing Infrastructure
//!
//! Configures the `tracing-subscriber` stack for the video platform core:
//! env-filter based module-level filtering and a choice of output formats.
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//!
//! let config = LoggingConfig::default()
//!     .with_format(LogFormat::Compact)
//!     .with_filter("core_cache=debug,info");
//! init_logging(config).expect("Failed to initialize logging");
//!
//! tracing::info!("Player core started");
//! ```

use crate::error::{Error, Result};
use tracing_subscriber::{filter::EnvFilter, fmt, util::SubscriberInitExt};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format with colors.
    Pretty,
    /// Structured JSON format for machine parsing.
    Json,
    /// Compact format for production.
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Filter directives (`RUST_LOG` syntax). The `RUST_LOG` environment
    /// variable overrides this when set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the default filter directives.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }
}

/// Initialize the global tracing subscriber.
///
/// Fails if a global subscriber is already installed or the filter string
/// does not parse.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| Error::LoggingInit(format!("invalid filter directives: {e}")))?;

    let result = match config.format {
        LogFormat::Pretty => fmt().with_env_filter(filter).pretty().finish().try_init(),
        LogFormat::Json => fmt().with_env_filter(filter).json().finish().try_init(),
        LogFormat::Compact => fmt().with_env_filter(filter).compact().finish().try_init(),
    };

    result.map_err(|e| Error::LoggingInit(e.to_string()))
}
