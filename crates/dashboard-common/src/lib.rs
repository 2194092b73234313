//! # Dashboard Common
//!
//! Shared plumbing for the Dashboard Pro service worker crates.
//!
//! ## Features
//!
//! - Unified error type with backtrace support for internal failures
//! - Logging configuration and setup
//! - Retry-with-backoff and timeout helpers used by the host side

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type for Dashboard Pro.
#[derive(Error, Debug)]
pub enum DashboardError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl DashboardError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            DashboardError::Config { .. } => "config",
            DashboardError::Io(_) => "io",
            DashboardError::Timeout(_) => "timeout",
            DashboardError::NotFound(_) => "not_found",
            DashboardError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for Dashboard Pro operations.
pub type Result<T> = std::result::Result<T, DashboardError>;

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| DashboardError::NotFound(resource.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(DashboardError::config("test").category(), "config");
        assert_eq!(
            DashboardError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
        assert_eq!(DashboardError::internal("boom").category(), "internal");
    }

    #[test]
    fn test_internal_captures_backtrace() {
        match DashboardError::internal("sync handler panicked") {
            DashboardError::Internal { message, backtrace } => {
                assert_eq!(message, "sync handler panicked");
                assert!(backtrace.is_some());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_config_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad json");
        let err = DashboardError::config_with_source("invalid worker config", io);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "Config error: invalid worker config");
    }

    #[test]
    fn test_option_ext() {
        let some: Option<i32> = Some(42);
        assert_eq!(some.ok_or_not_found("test").unwrap(), 42);

        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_not_found("active worker"),
            Err(DashboardError::NotFound(name)) if name == "active worker"
        ));
    }
}
