//! Local RPC message schema
//!
//! These messages are the only state shared between the CLI, the sandbox
//! manager and the root manager. They are versioned JSON; a peer built from
//! a different schema version is rejected rather than misread.

use axum::http::StatusCode;
use sandlink_core::{ConnectInvocationConfig, ServiceHealth};
use serde::{Deserialize, Serialize};

/// Version of the local RPC schema
pub const RPC_SCHEMA_VERSION: u32 = 1;

/// Header carrying [`RPC_SCHEMA_VERSION`] on every request
pub const SCHEMA_VERSION_HEADER: &str = "x-sandlink-rpc-version";

pub const APPLY_SANDBOX_PATH: &str = "/v1/sandboxes/apply";
pub const STATUS_PATH: &str = "/v1/status";
pub const SHUTDOWN_PATH: &str = "/v1/shutdown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySandboxRequest {
    /// Sandbox name
    pub name: String,
    /// Sandbox specification, passed through to the remote API
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySandboxResponse {
    /// The sandbox as returned by the remote API
    pub sandbox: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownResponse {}

/// Snapshot returned by the sandbox manager's `Status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Invocation config with secrets redacted
    pub connection_config: ConnectInvocationConfig,

    /// Network overlay health, when a root manager is configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_overlay: Option<ServiceHealth>,

    /// Hosts overlay health, when a root manager is configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<ServiceHealth>,

    /// Port-forward health, when the connection uses one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_forward: Option<ServiceHealth>,

    /// Address tunnels currently connect to
    #[serde(default)]
    pub forwarding_address: Option<String>,

    /// Whether the root manager answered the status query
    #[serde(default)]
    pub root_manager_reachable: bool,

    /// One entry per sandbox referencing this machine
    #[serde(default)]
    pub sandboxes: Vec<SandboxStatus>,
}

impl StatusResponse {
    /// Whether every service this connection depends on is healthy
    pub fn is_healthy(&self) -> bool {
        let ok = |h: &Option<ServiceHealth>| h.as_ref().map_or(true, |h| h.healthy);
        ok(&self.network_overlay)
            && ok(&self.hosts)
            && ok(&self.port_forward)
            && self.forwarding_address.is_some()
    }

    /// Status of one sandbox, by name
    pub fn sandbox(&self, name: &str) -> Option<&SandboxStatus> {
        self.sandboxes.iter().find(|s| s.name == name)
    }
}

/// Tunnel state of one sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub name: String,
    pub routing_key: String,
    #[serde(default)]
    pub tunnels: Vec<TunnelState>,
}

impl SandboxStatus {
    /// All tunnels are up (vacuously true for a sandbox with no workloads)
    pub fn all_tunnels_up(&self) -> bool {
        self.tunnels.iter().all(|t| t.up)
    }
}

/// State of one reverse tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelState {
    /// External workload name
    pub workload: String,
    /// Established from this side
    pub up: bool,
    /// Reported connected by the remote side
    pub remote_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Snapshot returned by the root manager's `Status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootStatusResponse {
    pub network_overlay: ServiceHealth,
    pub hosts: ServiceHealth,
    /// Address the overlays currently point at
    #[serde(default)]
    pub forwarding_address: Option<String>,
    /// PID of the supervised sandbox manager
    #[serde(default)]
    pub sandbox_manager_pid: Option<u32>,
}

/// Error classification shared by all RPC endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcCode {
    NotFound,
    InvalidArgument,
    Unavailable,
    Internal,
    #[serde(other)]
    Unknown,
}

impl RpcCode {
    pub fn http_status(self) -> StatusCode {
        match self {
            RpcCode::NotFound => StatusCode::NOT_FOUND,
            RpcCode::InvalidArgument => StatusCode::BAD_REQUEST,
            RpcCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            RpcCode::Internal | RpcCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classify a remote API status for `ApplySandbox`
    pub fn from_api_status(status: u16) -> Self {
        match status {
            404 => RpcCode::NotFound,
            502 => RpcCode::Unavailable,
            400..=499 => RpcCode::InvalidArgument,
            500..=599 => RpcCode::Internal,
            _ => RpcCode::Unknown,
        }
    }
}

/// JSON body of every RPC error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: RpcCode,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_status_mapping() {
        assert_eq!(RpcCode::from_api_status(404), RpcCode::NotFound);
        assert_eq!(RpcCode::from_api_status(400), RpcCode::InvalidArgument);
        assert_eq!(RpcCode::from_api_status(409), RpcCode::InvalidArgument);
        assert_eq!(RpcCode::from_api_status(502), RpcCode::Unavailable);
        assert_eq!(RpcCode::from_api_status(500), RpcCode::Internal);
        assert_eq!(RpcCode::from_api_status(503), RpcCode::Internal);
        assert_eq!(RpcCode::from_api_status(302), RpcCode::Unknown);
    }

    #[test]
    fn test_unknown_code_decodes() {
        let body: RpcErrorBody =
            serde_json::from_str(r#"{"code":"resource_exhausted","message":"x"}"#).unwrap();
        assert_eq!(body.code, RpcCode::Unknown);
    }

    #[test]
    fn test_sandbox_all_tunnels_up() {
        let mut status = SandboxStatus {
            name: "sb".to_string(),
            routing_key: "rk".to_string(),
            tunnels: vec![],
        };
        assert!(status.all_tunnels_up());
        status.tunnels.push(TunnelState {
            workload: "fe".to_string(),
            up: false,
            ..TunnelState::default()
        });
        assert!(!status.all_tunnels_up());
    }
}
