//! Errors from the remote API

use thiserror::Error;

/// Errors returned by [`crate::SandboxApi`] request/response calls
#[derive(Debug, Error)]
pub enum ApiError {
    /// The API answered with a non-success status
    #[error("API returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The request never got a response
    #[error("API request failed: {0}")]
    Transport(String),

    /// The response body was not what we expected
    #[error("invalid API response: {0}")]
    Decode(String),
}

impl ApiError {
    /// HTTP status, for errors that carry one
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
