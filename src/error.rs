//! Error types for pool operations
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type used for upstream causes (factory failures).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for pool operations
#[derive(Error, Debug)]
pub enum Error {
    /// Pool configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },

    /// Fail-fast initialization could not open and validate a handle
    #[error("Failed to initialize pool: {reason}")]
    PoolInitialization {
        /// The failure reason
        reason: String,
        /// The underlying factory error
        #[source]
        source: Option<BoxError>,
    },

    /// A borrow exhausted its deadline without obtaining a live handle
    #[error("Borrow timed out after {elapsed_ms}ms waiting for a handle")]
    BorrowTimeout {
        /// Milliseconds spent waiting before giving up
        elapsed_ms: u64,
        /// The most recent upstream creation failure, if any
        #[source]
        source: Option<BoxError>,
    },

    /// A parked borrower was woken because the pool started closing
    #[error("Borrow interrupted: pool is closing")]
    Interrupted,

    /// The operation was attempted on a shut-down pool
    #[error("Pool is shut down")]
    PoolShutdown,

    /// The operation is not legal in the pool's current configuration
    #[error("Illegal state: {message}")]
    IllegalState {
        /// The error message
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an illegal-state error
    pub fn illegal_state<S: Into<String>>(message: S) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BorrowTimeout { .. })
    }
}

/// Clonable wrapper around the most recent creation failure, so the same
/// upstream cause can be attached to every subsequent [`Error::BorrowTimeout`].
#[derive(Debug, Clone)]
pub(crate) struct SharedCause(pub(crate) Arc<dyn std::error::Error + Send + Sync>);

impl fmt::Display for SharedCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SharedCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}
