//! Control-channel messages exchanged with the tunnel proxy
//!
//! Messages are JSON text frames tagged by `type`.

use sandlink_core::PortMapping;
use serde::{Deserialize, Serialize};

use crate::{Result, TunnelError};

/// One control-channel message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Client to proxy: route this workload's traffic back here
    #[serde(rename_all = "camelCase")]
    Register {
        routing_key: String,
        workload: String,
        user: String,
        mappings: Vec<PortMapping>,
    },
    /// Proxy to client: registration accepted
    #[serde(rename_all = "camelCase")]
    Registered { tunnel_id: String },
    /// Proxy to client: registration refused
    Rejected { reason: String },
    /// Either direction; the receiver echoes it back
    Heartbeat { timestamp: u64 },
}

impl ControlMessage {
    /// Encode as a JSON text frame
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| TunnelError::protocol(e.to_string()))
    }

    /// Decode a JSON text frame
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| TunnelError::protocol(e.to_string()))
    }
}
