//! Root manager daemon
//!
//! Runs privileged. Supervises the sandbox manager (launched as the
//! downgrade user), owns the network and hosts overlays, and keeps those
//! overlays pointed at the sandbox manager's current forwarding address.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sandlink_core::{ConnectInvocationConfig, ServiceHealth, StatePaths, INVOCATION_CONFIG_ENV};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};

use crate::error::{AgentError, Result};
use crate::launcher::{ChildSpec, ProcessLauncher};
use crate::overlay::{
    CommandOverlayFactory, NoopOverlayFactory, OverlayFactory, OverlayKind, OverlayService,
};
use crate::pidfile::{remove_pid_file, write_pid_file};
use crate::rpc::{root_manager_router, serve, RootManagerService, RootStatusResponse, RpcClient};
use crate::supervisor::{SpecBuilder, Supervisor, SupervisorSettings};

/// Hidden CLI subcommand that runs the sandbox manager
pub const SANDBOX_MANAGER_SUBCOMMAND: &str = "sandbox-manager";

/// Tunables of the root manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootManagerSettings {
    /// Monitor period while the overlays are not healthy
    pub monitor_fast: Duration,
    /// Monitor period once they are
    pub monitor_slow: Duration,
    /// Bound on each sandbox manager status query
    pub status_timeout: Duration,
    pub supervisor: SupervisorSettings,
}

impl Default for RootManagerSettings {
    fn default() -> Self {
        Self {
            monitor_fast: Duration::from_secs(1),
            monitor_slow: Duration::from_secs(10),
            status_timeout: Duration::from_secs(3),
            supervisor: SupervisorSettings::default(),
        }
    }
}

struct ActiveOverlays {
    address: String,
    network: Box<dyn OverlayService>,
    hosts: Box<dyn OverlayService>,
}

impl ActiveOverlays {
    fn healthy(&self) -> bool {
        self.network.health().healthy && self.hosts.health().healthy
    }

    async fn close(self) {
        if let Err(e) = self.network.close().await {
            tracing::warn!(error = %e, "failed to close network overlay");
        }
        if let Err(e) = self.hosts.close().await {
            tracing::warn!(error = %e, "failed to close hosts overlay");
        }
        tracing::info!(address = %self.address, "overlays stopped");
    }
}

/// The pair of overlays, keyed to one forwarding address at a time
pub struct OverlayManager {
    network: Arc<dyn OverlayFactory>,
    hosts: Arc<dyn OverlayFactory>,
    active: Mutex<Option<ActiveOverlays>>,
    /// Why the last start failed, while nothing is active
    start_error: parking_lot::Mutex<Option<String>>,
}

impl OverlayManager {
    pub fn new(network: Arc<dyn OverlayFactory>, hosts: Arc<dyn OverlayFactory>) -> Self {
        Self {
            network,
            hosts,
            active: Mutex::new(None),
            start_error: parking_lot::Mutex::new(None),
        }
    }

    /// Factories for the helpers in `config`, no-ops where none is set
    pub fn from_config(config: &ConnectInvocationConfig) -> Result<Self> {
        Ok(Self::new(
            overlay_factory(OverlayKind::Network, config.overlay.network.as_ref())?,
            overlay_factory(OverlayKind::Hosts, config.overlay.hosts.as_ref())?,
        ))
    }

    /// Make sure healthy overlays run against `address`
    ///
    /// Overlays on another address, or unhealthy ones, are stopped before
    /// the new pair starts. Returns whether both are healthy afterwards.
    pub async fn ensure(&self, address: &str) -> bool {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            if current.address == address && current.healthy() {
                return true;
            }
        }

        if let Some(old) = active.take() {
            if old.address == address {
                tracing::warn!(address = %address, "overlay unhealthy, restarting");
            } else {
                tracing::info!(from = %old.address, to = %address, "forwarding address changed");
            }
            old.close().await;
        }

        match self.start(address).await {
            Ok(started) => {
                tracing::info!(address = %address, "overlays started");
                *self.start_error.lock() = None;
                let healthy = started.healthy();
                *active = Some(started);
                healthy
            }
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "failed to start overlays");
                *self.start_error.lock() = Some(e.to_string());
                false
            }
        }
    }

    async fn start(&self, address: &str) -> Result<ActiveOverlays> {
        let network = self.network.new_service(address)?;
        let hosts = match self.hosts.new_service(address) {
            Ok(hosts) => hosts,
            Err(e) => {
                let _ = network.close().await;
                return Err(e);
            }
        };
        Ok(ActiveOverlays {
            address: address.to_string(),
            network,
            hosts,
        })
    }

    /// Health of both overlays and the address they point at
    pub async fn snapshot(&self) -> (ServiceHealth, ServiceHealth, Option<String>) {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(current) => (
                current.network.health(),
                current.hosts.health(),
                Some(current.address.clone()),
            ),
            None => {
                let reason = self
                    .start_error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "waiting for forwarding address".to_string());
                let mut health = ServiceHealth::default();
                health.record_error(reason);
                (health.clone(), health, None)
            }
        }
    }

    /// Stop whatever overlays are running
    pub async fn stop(&self) {
        let active = self.active.lock().await.take();
        if let Some(active) = active {
            active.close().await;
        }
    }
}

fn overlay_factory(
    kind: OverlayKind,
    command: Option<&Vec<String>>,
) -> Result<Arc<dyn OverlayFactory>> {
    match command {
        Some(command) => Ok(Arc::new(CommandOverlayFactory::new(kind, command.clone())?)),
        None => Ok(Arc::new(NoopOverlayFactory(kind))),
    }
}

/// Keep the overlays on the sandbox manager's forwarding address
///
/// Polls fast until healthy, then slowly; any loss of health falls back to
/// the fast period.
pub async fn monitor_forwarding(
    sandbox_manager: RpcClient,
    overlays: Arc<OverlayManager>,
    settings: RootManagerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let healthy = match sandbox_manager.status().await {
            Ok(status) => match status.forwarding_address {
                Some(address) => overlays.ensure(&address).await,
                None => {
                    tracing::debug!("sandbox manager has no forwarding address yet");
                    false
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "sandbox manager status unavailable");
                false
            }
        };

        let delay = if healthy {
            settings.monitor_slow
        } else {
            settings.monitor_fast
        };
        tokio::select! {
            _ = shutdown.wait_for(|s| *s) => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// RPC surface of the root manager
pub struct RootManager {
    overlays: Arc<OverlayManager>,
    supervisor: Arc<Supervisor>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_requested: AtomicBool,
}

impl RootManager {
    pub fn new(
        overlays: Arc<OverlayManager>,
        supervisor: Arc<Supervisor>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            overlays,
            supervisor,
            shutdown_tx,
            shutdown_requested: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RootManagerService for RootManager {
    async fn status(&self) -> RootStatusResponse {
        let (network_overlay, hosts, forwarding_address) = self.overlays.snapshot().await;
        RootStatusResponse {
            network_overlay,
            hosts,
            forwarding_address,
            sandbox_manager_pid: self.supervisor.child_pid(),
        }
    }

    fn shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            tracing::info!("shutdown requested");
            self.shutdown_tx.send_replace(true);
        }
    }
}

/// Child specification that runs `program sandbox-manager` with `config`
pub fn sandbox_manager_spec(program: PathBuf, config: ConnectInvocationConfig) -> SpecBuilder {
    Arc::new(move || {
        Ok(ChildSpec::new(program.clone())
            .arg(SANDBOX_MANAGER_SUBCOMMAND)
            .env(INVOCATION_CONFIG_ENV, config.to_env_value()?))
    })
}

/// Run the root manager until shutdown is requested
///
/// `program` is the sandlink binary re-executed for the sandbox manager and
/// `launcher` crosses the privilege boundary.
pub async fn run_root_manager(
    config: ConnectInvocationConfig,
    program: PathBuf,
    launcher: Arc<dyn ProcessLauncher>,
    settings: RootManagerSettings,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    config.validate()?;
    let paths = StatePaths::new(&config.state_dir);
    let pid_file = paths.root_manager_pid_file();

    let addr = config.root_manager_addr();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| AgentError::Bind { addr, source })?;
    write_pid_file(&pid_file)?;
    tracing::info!(
        addr = %addr,
        pid = std::process::id(),
        user = %config.user.name,
        "root manager starting"
    );

    let overlays = Arc::new(OverlayManager::from_config(&config)?);
    let sandbox_manager = RpcClient::new(config.sandbox_manager_addr(), settings.status_timeout);
    let supervisor = Arc::new(Supervisor::start(
        launcher,
        sandbox_manager_spec(program, config.clone()),
        paths.sandbox_manager_pid_file(),
        sandbox_manager.with_timeout(settings.supervisor.graceful_timeout),
        settings.supervisor,
    ));

    let monitor = tokio::spawn(monitor_forwarding(
        sandbox_manager,
        Arc::clone(&overlays),
        settings,
        shutdown_tx.subscribe(),
    ));

    let manager = RootManager::new(
        Arc::clone(&overlays),
        Arc::clone(&supervisor),
        shutdown_tx.clone(),
    );
    let served = serve(listener, root_manager_router(Arc::new(manager)), shutdown_tx.subscribe()).await;
    shutdown_tx.send_replace(true);

    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "monitor task failed");
    }
    supervisor.stop().await;
    overlays.stop().await;
    remove_pid_file(&pid_file);
    tracing::info!("root manager stopped");

    served.map_err(|e| AgentError::Internal(format!("RPC server failed: {e}")))
}
