//! Watch stream of the sandboxes referencing this machine
//!
//! Each event is the complete current list; consumers diff it against what
//! they already run. Stream errors carry a [`WatchCode`] so the consumer can
//! tell transient failures (reconnect) from terminal ones (stop watching).
//!
//! A single sandbox can also be watched on its own; that stream carries the
//! sandbox with fresh workload status and ends with `NotFound` once the
//! sandbox is deleted.

use futures_util::stream::BoxStream;
use sandlink_core::Sandbox;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream of watch events
pub type WatchStream = BoxStream<'static, Result<Vec<Sandbox>, WatchError>>;

/// Stream of updates of one sandbox
pub type SandboxStream = BoxStream<'static, Result<Sandbox, WatchError>>;

/// Classification of a watch failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchCode {
    Internal,
    Unavailable,
    NotFound,
    PermissionDenied,
    Unauthenticated,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl WatchCode {
    /// Transient codes are retried with backoff; everything else ends the watch
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, WatchCode::Internal | WatchCode::Unavailable)
    }

    /// Map an HTTP status of the watch request
    #[must_use]
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 => WatchCode::Unauthenticated,
            403 => WatchCode::PermissionDenied,
            404 => WatchCode::NotFound,
            502..=504 => WatchCode::Unavailable,
            500..=599 => WatchCode::Internal,
            _ => WatchCode::Unknown,
        }
    }
}

/// A failed watch
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("watch failed ({code:?}): {message}")]
pub struct WatchError {
    pub code: WatchCode,
    pub message: String,
}

impl WatchError {
    pub fn new(code: WatchCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }
}

/// One line of the watch stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchEvent {
    /// Current set of sandboxes referencing this machine
    Sandboxes(Vec<Sandbox>),
    /// The server ended the watch
    Error(WatchError),
}

impl WatchEvent {
    /// Decode one NDJSON line
    pub fn decode(line: &[u8]) -> Result<Vec<Sandbox>, WatchError> {
        match serde_json::from_slice::<WatchEvent>(line) {
            Ok(WatchEvent::Sandboxes(sandboxes)) => Ok(sandboxes),
            Ok(WatchEvent::Error(err)) => Err(err),
            Err(e) => Err(WatchError::new(
                WatchCode::Internal,
                format!("undecodable watch event: {e}"),
            )),
        }
    }
}

/// One line of a single-sandbox watch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SandboxEvent {
    Sandbox(Sandbox),
    Error(WatchError),
}

impl SandboxEvent {
    /// Decode one NDJSON line
    pub fn decode(line: &[u8]) -> Result<Sandbox, WatchError> {
        match serde_json::from_slice::<SandboxEvent>(line) {
            Ok(SandboxEvent::Sandbox(sandbox)) => Ok(sandbox),
            Ok(SandboxEvent::Error(err)) => Err(err),
            Err(e) => Err(WatchError::new(
                WatchCode::Internal,
                format!("undecodable sandbox event: {e}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_codes() {
        assert!(WatchCode::Internal.is_transient());
        assert!(WatchCode::Unavailable.is_transient());
        assert!(!WatchCode::NotFound.is_transient());
        assert!(!WatchCode::Unauthenticated.is_transient());
        assert!(!WatchCode::Unknown.is_transient());
    }

    #[test]
    fn test_from_http_status() {
        assert_eq!(WatchCode::from_http_status(401), WatchCode::Unauthenticated);
        assert_eq!(WatchCode::from_http_status(403), WatchCode::PermissionDenied);
        assert_eq!(WatchCode::from_http_status(404), WatchCode::NotFound);
        assert_eq!(WatchCode::from_http_status(503), WatchCode::Unavailable);
        assert_eq!(WatchCode::from_http_status(500), WatchCode::Internal);
        assert_eq!(WatchCode::from_http_status(418), WatchCode::Unknown);
    }

    #[test]
    fn test_decode_events() {
        let sandboxes =
            WatchEvent::decode(br#"{"sandboxes":[{"name":"sb1","routingKey":"rk1"}]}"#).unwrap();
        assert_eq!(sandboxes.len(), 1);
        assert_eq!(sandboxes[0].routing_key, "rk1");

        let err = WatchEvent::decode(
            br#"{"error":{"code":"permission_denied","message":"revoked"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code, WatchCode::PermissionDenied);

        let err = WatchEvent::decode(br#"{"error":{"code":"brand_new","message":"?"}}"#)
            .unwrap_err();
        assert_eq!(err.code, WatchCode::Unknown);

        let err = WatchEvent::decode(b"not json").unwrap_err();
        assert_eq!(err.code, WatchCode::Internal);
    }

    #[test]
    fn test_decode_sandbox_events() {
        let sandbox = SandboxEvent::decode(
            br#"{"sandbox":{"name":"sb1","routingKey":"rk1","externalWorkloads":[]}}"#,
        )
        .unwrap();
        assert_eq!(sandbox.name, "sb1");

        let err = SandboxEvent::decode(br#"{"error":{"code":"not_found","message":"deleted"}}"#)
            .unwrap_err();
        assert_eq!(err.code, WatchCode::NotFound);
    }
}
