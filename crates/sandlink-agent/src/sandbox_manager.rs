//! Sandbox manager daemon
//!
//! Runs as the unprivileged user. Hosts the local RPC server, the remote API
//! session, the sandbox watcher and, for port-forward connections, the
//! port-forward to the tunnel proxy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sandlink_api::{ApiError, HttpSandboxApi, SandboxApi};
use sandlink_core::{machine_id, ConnectInvocationConfig, ConnectionConfig, ServiceHealth, StatePaths};
use sandlink_tunnel::WsTunnelClient;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::{AgentError, Result};
use crate::pidfile::{remove_pid_file, write_pid_file};
use crate::port_forward::{PortForward, PortForwardSettings, PortForwardTarget};
use crate::rpc::{
    sandbox_manager_router, serve, ApplySandboxRequest, ApplySandboxResponse, RpcClient, RpcCode,
    RpcError, SandboxManagerService, StatusResponse,
};
use crate::watcher::{SandboxWatcher, WatcherSettings};

/// Tunables of the sandbox manager
#[derive(Debug, Clone)]
pub struct SandboxManagerSettings {
    /// Bound on the root manager status query inside `Status`
    pub root_status_timeout: Duration,
    pub watcher: WatcherSettings,
    pub port_forward: PortForwardSettings,
}

impl Default for SandboxManagerSettings {
    fn default() -> Self {
        Self {
            root_status_timeout: Duration::from_secs(3),
            watcher: WatcherSettings::default(),
            port_forward: PortForwardSettings::default(),
        }
    }
}

/// RPC surface of the sandbox manager
pub struct SandboxManager {
    config: ConnectInvocationConfig,
    api: Arc<dyn SandboxApi>,
    watcher: SandboxWatcher,
    forwarding: watch::Receiver<Option<String>>,
    port_forward: Option<Arc<PortForward>>,
    root_manager: Option<RpcClient>,
    root_status_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_requested: AtomicBool,
}

impl SandboxManager {
    pub fn new(
        config: ConnectInvocationConfig,
        api: Arc<dyn SandboxApi>,
        watcher: SandboxWatcher,
        forwarding: watch::Receiver<Option<String>>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            config,
            api,
            watcher,
            forwarding,
            port_forward: None,
            root_manager: None,
            root_status_timeout: Duration::from_secs(3),
            shutdown_tx,
            shutdown_requested: AtomicBool::new(false),
        }
    }

    /// Report the health of this port-forward in `Status`
    #[must_use]
    pub fn with_port_forward(mut self, port_forward: Arc<PortForward>) -> Self {
        self.port_forward = Some(port_forward);
        self
    }

    /// Query this root manager for overlay health in `Status`
    #[must_use]
    pub fn with_root_manager(mut self, client: RpcClient, timeout: Duration) -> Self {
        self.root_manager = Some(client);
        self.root_status_timeout = timeout;
        self
    }
}

fn unreachable_health(reason: &str) -> ServiceHealth {
    let mut health = ServiceHealth::default();
    health.record_error(format!("root manager unreachable: {reason}"));
    health
}

#[async_trait]
impl SandboxManagerService for SandboxManager {
    async fn apply_sandbox(
        &self,
        request: ApplySandboxRequest,
    ) -> std::result::Result<ApplySandboxResponse, RpcError> {
        let applied = self
            .api
            .apply_sandbox(&request.name, &request.spec)
            .await
            .map_err(|e| {
                tracing::warn!(sandbox = %request.name, error = %e, "apply failed");
                match e {
                    ApiError::Status { status, message } => {
                        RpcError::new(RpcCode::from_api_status(status), message)
                    }
                    ApiError::Transport(message) => RpcError::new(RpcCode::Unavailable, message),
                    ApiError::Decode(message) => RpcError::new(RpcCode::Internal, message),
                }
            })?;

        tracing::info!(
            sandbox = %applied.sandbox.name,
            routing_key = %applied.sandbox.routing_key,
            "sandbox applied"
        );
        self.watcher.register_sandbox(applied.sandbox);
        Ok(ApplySandboxResponse {
            sandbox: applied.raw,
        })
    }

    async fn status(&self) -> StatusResponse {
        let (network_overlay, hosts, root_manager_reachable) = match &self.root_manager {
            None => (None, None, false),
            Some(client) => {
                match tokio::time::timeout(self.root_status_timeout, client.root_status()).await {
                    Ok(Ok(root)) => (Some(root.network_overlay), Some(root.hosts), true),
                    Ok(Err(e)) => {
                        let reason = e.to_string();
                        tracing::debug!(error = %reason, "root manager status failed");
                        (
                            Some(unreachable_health(&reason)),
                            Some(unreachable_health(&reason)),
                            false,
                        )
                    }
                    Err(_) => {
                        let reason = format!("no answer within {:?}", self.root_status_timeout);
                        tracing::debug!("root manager status timed out");
                        (
                            Some(unreachable_health(&reason)),
                            Some(unreachable_health(&reason)),
                            false,
                        )
                    }
                }
            }
        };

        StatusResponse {
            connection_config: self.config.redacted(),
            network_overlay,
            hosts,
            port_forward: self.port_forward.as_ref().map(|pf| pf.health()),
            forwarding_address: self.forwarding.borrow().clone(),
            root_manager_reachable,
            sandboxes: self.watcher.statuses(),
        }
    }

    fn shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            tracing::info!("shutdown requested");
            self.shutdown_tx.send_replace(true);
        }
    }
}

/// Run the sandbox manager until shutdown is requested
///
/// Shutdown comes from the `Shutdown` RPC or from whoever holds
/// `shutdown_tx` (the binary forwards SIGINT/SIGTERM there). Failing to bind
/// the RPC port is fatal.
pub async fn run_sandbox_manager(
    config: ConnectInvocationConfig,
    settings: SandboxManagerSettings,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    config.validate()?;
    let paths = StatePaths::new(&config.state_dir);
    let pid_file = paths.sandbox_manager_pid_file();

    let addr = config.sandbox_manager_addr();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| AgentError::Bind { addr, source })?;
    write_pid_file(&pid_file)?;
    tracing::info!(
        addr = %addr,
        pid = std::process::id(),
        cluster = %config.cluster,
        "sandbox manager starting"
    );

    let (port_forward, forwarding) = match &config.connection {
        ConnectionConfig::ProxyAddress { address } => {
            let (_tx, rx) = watch::channel(Some(address.clone()));
            (None, rx)
        }
        ConnectionConfig::PortForward {
            kube_context,
            namespace,
            service,
            port,
        } => {
            let pf = Arc::new(PortForward::start(
                PortForwardTarget {
                    kube_context: kube_context.clone(),
                    namespace: namespace.clone(),
                    service: service.clone(),
                    port: *port,
                },
                settings.port_forward.clone(),
            ));
            let rx = pf.address();
            (Some(pf), rx)
        }
    };

    let api: Arc<dyn SandboxApi> =
        Arc::new(HttpSandboxApi::new(&config.api_url, &config.org, &config.api_key)?);
    let tunnels = Arc::new(WsTunnelClient::new(forwarding.clone()));
    let machine = machine_id();
    tracing::debug!(machine_id = %machine, "machine identity");
    let watcher = SandboxWatcher::new(Arc::clone(&api), tunnels, machine, settings.watcher);

    let mut manager = SandboxManager::new(
        config.clone(),
        api,
        watcher.clone(),
        forwarding,
        shutdown_tx.clone(),
    );
    if let Some(pf) = &port_forward {
        manager = manager.with_port_forward(Arc::clone(pf));
    }
    if config.with_root_manager {
        manager = manager.with_root_manager(
            RpcClient::new(config.root_manager_addr(), settings.root_status_timeout),
            settings.root_status_timeout,
        );
    }

    let watch_task = {
        let watcher = watcher.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { watcher.run(shutdown).await })
    };

    let served = serve(listener, sandbox_manager_router(Arc::new(manager)), shutdown_tx.subscribe()).await;
    // The server can also end on its own; make sure everything else follows.
    shutdown_tx.send_replace(true);
    if let Err(e) = watch_task.await {
        tracing::warn!(error = %e, "watch task failed");
    }

    watcher.shutdown().await;
    if let Some(pf) = port_forward {
        pf.stop().await;
    }
    remove_pid_file(&pid_file);
    tracing::info!("sandbox manager stopped");

    served.map_err(|e| AgentError::Internal(format!("RPC server failed: {e}")))
}
