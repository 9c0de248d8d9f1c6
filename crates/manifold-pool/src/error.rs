//! Error types for manifold-pool
//!
//! Errors are classified so callers can distinguish the failures the pool
//! surfaces (deadlines, administrative drops, shutdown) from transport
//! failures that cascade through a host pool. The type is `Clone` because a
//! single failure is fanned out to every waiter queued on the same host.

use thiserror::Error;

/// Result type for manifold-pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for manifold-pool
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The pool (or a host pool) is being torn down
    #[error("pool shutdown: {message}")]
    PoolShutdown { message: String },

    /// Connections to a host were administratively dropped
    #[error("pooled connections dropped: {message}")]
    ConnectionsDropped { message: String },

    /// A request or connect/refresh attempt exceeded its time limit
    #[error("exceeded time limit: {message}")]
    DeadlineExceeded { message: String },

    /// The transport failed to set up or refresh a connection
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    /// A connection string could not be parsed
    #[error("invalid connection string: {message}")]
    InvalidConnectionString { message: String },
}

impl Error {
    /// Create a shutdown error
    pub fn pool_shutdown(message: impl Into<String>) -> Self {
        Self::PoolShutdown {
            message: message.into(),
        }
    }

    /// Create an administrative-drop error
    pub fn connections_dropped(message: impl Into<String>) -> Self {
        Self::ConnectionsDropped {
            message: message.into(),
        }
    }

    /// Create a deadline error
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            message: message.into(),
        }
    }

    /// Create a transport-failure error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    /// Create a connection-string parse error
    pub fn invalid_connection_string(message: impl Into<String>) -> Self {
        Self::InvalidConnectionString {
            message: message.into(),
        }
    }

    /// Whether this error is a deadline elapse.
    ///
    /// A connect or refresh attempt that misses its deadline is recovered
    /// inside the pool by respawning; it never cascades into a host-wide
    /// failure the way a transport error does.
    #[inline]
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// Whether retrying the operation could plausibly succeed
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded { .. } | Self::ConnectionFailed { .. }
        )
    }
}
