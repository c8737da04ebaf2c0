//! Core error types for sandlink
//!
//! This module defines the error hierarchy shared by the sandlink crates.

use std::path::PathBuf;
use thiserror::Error;

/// Global sandlink error type
#[derive(Debug, Error)]
pub enum SandlinkError {
    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors with context
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SandlinkError {
    /// Wrap an IO error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SandlinkError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Missing required configuration
    #[error("missing required configuration: {0}")]
    Missing(String),

    /// Invalid configuration value
    #[error("invalid configuration for {key}: {reason}")]
    Invalid { key: String, reason: String },

    /// Failed to load configuration file
    #[error("failed to load config from {path}: {reason}")]
    LoadFailed { path: PathBuf, reason: String },

    /// The invocation config was produced by an incompatible binary
    #[error("unsupported invocation config schema version {found} (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    /// Failed to encode or decode the invocation config
    #[error("invalid invocation config encoding: {0}")]
    Encoding(String),
}

impl ConfigError {
    /// Create an invalid-value error
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for sandlink core operations
pub type Result<T, E = SandlinkError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::SchemaVersion {
            found: 7,
            expected: 1,
        };
        assert_eq!(
            err.to_string(),
            "unsupported invocation config schema version 7 (expected 1)"
        );

        let err: SandlinkError = ConfigError::Missing("api key".to_string()).into();
        assert!(err.to_string().contains("api key"));
    }
}
