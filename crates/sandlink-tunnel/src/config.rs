//! Tunnel configuration

use std::fmt;

use sandlink_core::{ExternalWorkload, PortMapping};
use serde::{Deserialize, Serialize};

/// Configuration of one reverse tunnel
///
/// A tunnel is identified by its [`TunnelKey`]; the port mappings are what
/// the proxy routes through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Routing key of the owning sandbox
    pub routing_key: String,
    /// External workload name
    pub workload: String,
    /// Identity of this machine
    pub user: String,
    /// Baseline port to local address mappings
    pub mappings: Vec<PortMapping>,
}

impl TunnelConfig {
    /// Build the tunnel configuration for a sandbox workload
    #[must_use]
    pub fn for_workload(
        routing_key: impl Into<String>,
        workload: &ExternalWorkload,
        user: impl Into<String>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            workload: workload.name.clone(),
            user: user.into(),
            mappings: workload.workload_port_mapping.clone(),
        }
    }

    #[must_use]
    pub fn key(&self) -> TunnelKey {
        TunnelKey {
            routing_key: self.routing_key.clone(),
            workload: self.workload.clone(),
            user: self.user.clone(),
        }
    }
}

/// Identity of a reverse tunnel: routing key, workload and user
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub routing_key: String,
    pub workload: String,
    pub user: String,
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.routing_key, self.workload, self.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandlink_core::{BaselineRef, WorkloadStatus};

    #[test]
    fn test_for_workload() {
        let workload = ExternalWorkload {
            name: "frontend".to_string(),
            baseline: BaselineRef {
                kind: "Deployment".to_string(),
                namespace: "hotrod".to_string(),
                name: "frontend".to_string(),
            },
            workload_port_mapping: vec![PortMapping {
                baseline_port: 8080,
                local_address: "localhost:3000".to_string(),
            }],
            status: WorkloadStatus::default(),
        };

        let config = TunnelConfig::for_workload("rk1", &workload, "m-abc");
        assert_eq!(config.mappings.len(), 1);
        assert_eq!(config.key().to_string(), "rk1/frontend@m-abc");
    }
}
