//! Error types for the Tollgate service.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a counter/block store.
///
/// Policy denials are never represented here; a store error always means
/// the decision could not be made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store was reached but the operation failed
    #[error("Store operation failed: {0}")]
    Backend(String),

    /// The operation did not complete before its deadline
    #[error("Store operation `{op}` timed out after {after:?}")]
    Timeout {
        /// Name of the store primitive that timed out
        op: &'static str,
        /// The deadline that elapsed
        after: Duration,
    },
}

impl StoreError {
    /// Whether this error is a deadline expiry rather than a backend failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }
}

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter/block store errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
