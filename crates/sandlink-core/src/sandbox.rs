//! Sandbox data model
//!
//! These types describe the desired state pushed by the remote watch stream.
//! An [`ExternalWorkload`] is immutable once received: updates replace it
//! wholesale. Equality for reconciliation goes through [`WorkloadSpec`], which
//! leaves out status-only fields.

use serde::{Deserialize, Serialize};

/// A sandbox that references this machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    /// Sandbox name
    pub name: String,

    /// Opaque identifier of the sandbox instance
    pub routing_key: String,

    /// Workloads redirected to this machine, in remote order
    #[serde(default)]
    pub external_workloads: Vec<ExternalWorkload>,

    /// Resources referenced by the sandbox
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
}

impl Sandbox {
    /// An empty sandbox, used to tear down all tunnels
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Look up a workload by name
    pub fn workload(&self, name: &str) -> Option<&ExternalWorkload> {
        self.external_workloads.iter().find(|w| w.name == name)
    }
}

/// One workload slot of a sandbox that runs locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalWorkload {
    /// Workload name, unique within the sandbox
    pub name: String,

    /// The cluster workload being shadowed
    pub baseline: BaselineRef,

    /// Baseline port to local address mappings
    #[serde(default)]
    pub workload_port_mapping: Vec<PortMapping>,

    /// Status reported by the remote side
    #[serde(default)]
    pub status: WorkloadStatus,
}

impl ExternalWorkload {
    /// Projection used to decide whether the tunnel must be rebuilt
    pub fn spec(&self) -> WorkloadSpec {
        WorkloadSpec {
            baseline: self.baseline.clone(),
            mappings: self.workload_port_mapping.clone(),
        }
    }
}

/// Reference to a Kubernetes workload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineRef {
    /// Workload kind, e.g. `Deployment`
    pub kind: String,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl std::fmt::Display for BaselineRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Redirects one baseline port to a local address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// Port on the baseline workload
    pub baseline_port: u16,
    /// Local address, `host:port`
    pub local_address: String,
}

/// Remote-side status of an external workload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// Whether the remote side sees the reverse tunnel connected
    #[serde(default)]
    pub connected: bool,
}

/// Resource referenced by a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// Resource name
    pub name: String,
    /// Plugin providing the resource
    #[serde(default)]
    pub plugin: String,
}

/// Equality projection of an [`ExternalWorkload`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadSpec {
    /// Baseline reference
    pub baseline: BaselineRef,
    /// Port mappings, order-sensitive
    pub mappings: Vec<PortMapping>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(name: &str, port: u16, connected: bool) -> ExternalWorkload {
        ExternalWorkload {
            name: name.to_string(),
            baseline: BaselineRef {
                kind: "Deployment".to_string(),
                namespace: "default".to_string(),
                name: "frontend".to_string(),
            },
            workload_port_mapping: vec![PortMapping {
                baseline_port: 8080,
                local_address: format!("localhost:{port}"),
            }],
            status: WorkloadStatus { connected },
        }
    }

    #[test]
    fn test_spec_ignores_status() {
        let a = workload("fe", 3000, false);
        let b = workload("fe", 3000, true);
        assert_ne!(a, b);
        assert_eq!(a.spec(), b.spec());
    }

    #[test]
    fn test_spec_detects_mapping_change() {
        let a = workload("fe", 3000, true);
        let b = workload("fe", 3001, true);
        assert_ne!(a.spec(), b.spec());
    }

    #[test]
    fn test_deserialize_watch_payload() {
        let sb: Sandbox = serde_json::from_str(
            r#"{
                "name": "feature-x",
                "routingKey": "rk123",
                "externalWorkloads": [{
                    "name": "fe",
                    "baseline": {"kind": "Deployment", "namespace": "hotrod", "name": "frontend"},
                    "workloadPortMapping": [{"baselinePort": 8080, "localAddress": "localhost:3000"}]
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(sb.routing_key, "rk123");
        let fe = sb.workload("fe").unwrap();
        assert!(!fe.status.connected);
        assert_eq!(fe.baseline.to_string(), "Deployment/hotrod/frontend");
        assert!(sb.resources.is_empty());
    }
}
