//! Error types for tunnel operations

use thiserror::Error;

/// Errors that can occur while setting up or running a reverse tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Setup could not start (no forwarding address, bad config)
    #[error("Setup error: {message}")]
    Setup {
        /// What prevented setup
        message: String,
    },

    /// Protocol-level error (unexpected or undecodable control message)
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message describing the protocol violation
        message: String,
    },

    /// The tunnel proxy refused the registration
    #[error("Registration rejected: {reason}")]
    Rejected {
        /// Reason given by the proxy
        reason: String,
    },

    /// Connection error (connection refused, reset, closed)
    #[error("Connection error: {source}")]
    Connection {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// The tunnel is being closed
    #[error("Tunnel is shutting down")]
    Shutdown,
}

impl TunnelError {
    /// Create a new setup error
    #[must_use]
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new rejection error
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Create a new connection error from any error type
    #[must_use]
    pub fn connection<E: std::error::Error>(err: E) -> Self {
        Self::Connection {
            source: std::io::Error::other(err.to_string()),
        }
    }

    /// Create a new connection error with a message
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            source: std::io::Error::other(message.into()),
        }
    }
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;
