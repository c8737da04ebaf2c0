//! Agent-specific errors

use std::net::SocketAddr;
use std::path::PathBuf;

use sandlink_core::ConfigError;
use thiserror::Error;

use crate::rpc::RpcCode;

/// Errors raised by the sandlink daemons
#[derive(Debug, Error)]
pub enum AgentError {
    /// A local RPC call failed
    #[error("RPC failed ({code:?}): {message}")]
    Rpc { code: RpcCode, message: String },

    /// The remote API failed
    #[error("remote API error: {0}")]
    Api(#[from] sandlink_api::ApiError),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Could not bind a listening socket
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Failed to launch a child process
    #[error("failed to launch '{program}': {reason}")]
    Launch { program: String, reason: String },

    /// Failed to signal or wait on a process
    #[error("process {pid}: {reason}")]
    Process { pid: u32, reason: String },

    /// IO error with the path involved
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Create an RPC error
    pub fn rpc(code: RpcCode, message: impl Into<String>) -> Self {
        AgentError::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Create an IO error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a launch error
    pub fn launch(program: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        AgentError::Launch {
            program: program.into(),
            reason: reason.to_string(),
        }
    }

    /// RPC code of this error, if it came from a local RPC call
    pub fn rpc_code(&self) -> Option<RpcCode> {
        match self {
            AgentError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_code() {
        let err = AgentError::rpc(RpcCode::NotFound, "no such sandbox");
        assert_eq!(err.rpc_code(), Some(RpcCode::NotFound));
        assert_eq!(err.to_string(), "RPC failed (NotFound): no such sandbox");

        let err = AgentError::Internal("boom".to_string());
        assert_eq!(err.rpc_code(), None);
    }
}
