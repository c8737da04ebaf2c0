//! Configuration structures for sandlink
//!
//! [`ConnectInvocationConfig`] is computed once per `connect` invocation and is
//! read-only for the life of both daemons. It crosses the privilege boundary
//! in a single environment variable, so it carries an explicit schema version.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, SandlinkError};

/// Environment variable carrying the serialized invocation config
pub const INVOCATION_CONFIG_ENV: &str = "SANDLINK_CONNECT_INVOCATION_CONFIG";

/// Current schema version of [`ConnectInvocationConfig`]
pub const INVOCATION_SCHEMA_VERSION: u32 = 1;

/// Default loopback port of the sandbox manager RPC server
pub const DEFAULT_SANDBOX_MANAGER_PORT: u16 = 6666;

/// Default loopback port of the root manager RPC server
pub const DEFAULT_ROOT_MANAGER_PORT: u16 = 6667;

/// Process-wide configuration of one `connect` invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectInvocationConfig {
    /// Schema version, checked on decode
    pub schema_version: u32,

    /// Base URL of the remote control-plane API
    pub api_url: String,

    /// API key used for the remote API session
    pub api_key: String,

    /// Organization owning the cluster
    pub org: String,

    /// Cluster identity
    pub cluster: String,

    /// How the local machine reaches the cluster
    pub connection: ConnectionConfig,

    /// Whether a privileged root manager supervises the sandbox manager
    pub with_root_manager: bool,

    /// Loopback port of the sandbox manager RPC server
    #[serde(default = "default_sandbox_manager_port")]
    pub sandbox_manager_port: u16,

    /// Loopback port of the root manager RPC server
    #[serde(default = "default_root_manager_port")]
    pub root_manager_port: u16,

    /// Unprivileged user the sandbox manager runs as
    pub user: DowngradeUser,

    /// State directory (PID files, logs, CLI config)
    pub state_dir: PathBuf,

    /// Verbose daemon logging
    #[serde(default)]
    pub debug: bool,

    /// Helper commands implementing the OS overlay services
    #[serde(default)]
    pub overlay: OverlayCommands,
}

fn default_sandbox_manager_port() -> u16 {
    DEFAULT_SANDBOX_MANAGER_PORT
}

fn default_root_manager_port() -> u16 {
    DEFAULT_ROOT_MANAGER_PORT
}

/// Connection to the cluster's tunnel proxy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionConfig {
    /// The tunnel proxy is directly reachable at a fixed address
    #[serde(rename_all = "camelCase")]
    ProxyAddress {
        /// host:port of the proxy
        address: String,
    },
    /// Reach the tunnel proxy through `kubectl port-forward`
    #[serde(rename_all = "camelCase")]
    PortForward {
        /// kubeconfig context
        kube_context: String,
        /// Namespace of the proxy service
        #[serde(default = "default_proxy_namespace")]
        namespace: String,
        /// Proxy service name
        #[serde(default = "default_proxy_service")]
        service: String,
        /// Proxy service port
        #[serde(default = "default_proxy_port")]
        port: u16,
    },
}

fn default_proxy_namespace() -> String {
    "sandlink".to_string()
}

fn default_proxy_service() -> String {
    "tunnel-proxy".to_string()
}

fn default_proxy_port() -> u16 {
    1080
}

impl ConnectionConfig {
    /// Port-forward to the default proxy service through `kube_context`
    pub fn port_forward(kube_context: impl Into<String>) -> Self {
        ConnectionConfig::PortForward {
            kube_context: kube_context.into(),
            namespace: default_proxy_namespace(),
            service: default_proxy_service(),
            port: default_proxy_port(),
        }
    }

    /// Whether this connection needs a port-forward owned by the sandbox manager
    pub fn is_port_forward(&self) -> bool {
        matches!(self, ConnectionConfig::PortForward { .. })
    }
}

/// Identity of the OS user the sandbox manager is downgraded to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DowngradeUser {
    /// Login name
    pub name: String,
    /// Numeric user id
    pub uid: u32,
    /// Numeric group id
    pub gid: u32,
    /// Home directory
    pub home: PathBuf,
}

/// External helper commands for the network-overlay and hosts-overlay services
///
/// Each helper is started with the current forwarding address as its last
/// argument and runs until terminated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OverlayCommands {
    /// Network overlay helper (virtual-IP mapping)
    pub network: Option<Vec<String>>,
    /// Hosts-file overlay helper
    pub hosts: Option<Vec<String>>,
}

impl ConnectInvocationConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version != INVOCATION_SCHEMA_VERSION {
            return Err(ConfigError::SchemaVersion {
                found: self.schema_version,
                expected: INVOCATION_SCHEMA_VERSION,
            });
        }
        if self.api_url.is_empty() {
            return Err(ConfigError::Missing("api url".to_string()));
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::Missing("api key".to_string()));
        }
        if self.org.is_empty() {
            return Err(ConfigError::Missing("org".to_string()));
        }
        if self.cluster.is_empty() {
            return Err(ConfigError::Missing("cluster".to_string()));
        }
        if self.sandbox_manager_port == self.root_manager_port {
            return Err(ConfigError::invalid(
                "rootManagerPort",
                "must differ from sandboxManagerPort",
            ));
        }
        if let ConnectionConfig::ProxyAddress { address } = &self.connection {
            if address.is_empty() {
                return Err(ConfigError::invalid("connection.address", "empty"));
            }
        }
        Ok(())
    }

    /// Encode for transport in [`INVOCATION_CONFIG_ENV`]
    pub fn to_env_value(&self) -> Result<String, ConfigError> {
        let json =
            serde_json::to_vec(self).map_err(|e| ConfigError::Encoding(e.to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    /// Decode a value produced by [`Self::to_env_value`]
    pub fn from_env_value(value: &str) -> Result<Self, ConfigError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(value.trim())
            .map_err(|e| ConfigError::Encoding(e.to_string()))?;

        // Check the version before the full decode so that an incompatible
        // peer gets a version error rather than a field error.
        let value: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|e| ConfigError::Encoding(e.to_string()))?;
        let found = value
            .get("schemaVersion")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;
        if found != INVOCATION_SCHEMA_VERSION {
            return Err(ConfigError::SchemaVersion {
                found,
                expected: INVOCATION_SCHEMA_VERSION,
            });
        }

        let config: Self =
            serde_json::from_value(value).map_err(|e| ConfigError::Encoding(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read the config from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let value = std::env::var(INVOCATION_CONFIG_ENV)
            .map_err(|_| ConfigError::Missing(INVOCATION_CONFIG_ENV.to_string()))?;
        Self::from_env_value(&value)
    }

    /// Copy safe to expose through `Status`
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.api_key.is_empty() {
            copy.api_key = "<redacted>".to_string();
        }
        copy
    }

    /// Loopback address of the sandbox manager RPC server
    pub fn sandbox_manager_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.sandbox_manager_port))
    }

    /// Loopback address of the root manager RPC server
    pub fn root_manager_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.root_manager_port))
    }
}

/// Settings file for the CLI (`<state_dir>/config.yaml`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    /// Remote API base URL
    #[serde(default)]
    pub api_url: Option<String>,

    /// Remote API key
    #[serde(default)]
    pub api_key: Option<String>,

    /// Organization
    #[serde(default)]
    pub org: Option<String>,

    /// Defaults for `connect`
    #[serde(default)]
    pub local: LocalConfig,
}

/// `local:` section of the CLI config
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    /// Cluster to connect to
    #[serde(default)]
    pub cluster: Option<String>,

    /// Connection to the cluster
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,

    /// Run without the privileged root manager
    #[serde(default)]
    pub unprivileged: bool,

    /// Overlay helper commands
    #[serde(default)]
    pub overlay: OverlayCommands,
}

impl CliConfig {
    /// Load the CLI config, returning defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self, SandlinkError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str(&contents).map_err(|e| {
                ConfigError::LoadFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
                .into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(SandlinkError::io(path, e)),
        }
    }
}
