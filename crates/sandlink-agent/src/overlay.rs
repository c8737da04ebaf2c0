//! OS overlay services run by the root manager
//!
//! The network overlay (virtual-IP mapping) and the hosts overlay
//! (hosts-file rewriting) are external collaborators. The root manager only
//! creates them against a forwarding address, reads their health and closes
//! them. [`CommandOverlayFactory`] runs each one as a helper process that
//! receives the forwarding address as its last argument.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sandlink_core::ServiceHealth;
use tokio::process::Command;
use tokio::sync::watch;

use crate::error::{AgentError, Result};

/// Which overlay a service implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayKind {
    Network,
    Hosts,
}

impl fmt::Display for OverlayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayKind::Network => f.write_str("network"),
            OverlayKind::Hosts => f.write_str("hosts"),
        }
    }
}

/// A running overlay service
#[async_trait]
pub trait OverlayService: Send + Sync {
    /// Stop the service and release what it holds
    async fn close(&self) -> Result<()>;

    fn health(&self) -> ServiceHealth;
}

/// Creates overlay services for a forwarding address
pub trait OverlayFactory: Send + Sync {
    fn new_service(&self, forwarding_address: &str) -> Result<Box<dyn OverlayService>>;
}

/// Overlay that does nothing and is always healthy
///
/// Used when no helper is configured for an overlay.
#[derive(Debug, Clone, Copy)]
pub struct NoopOverlayFactory(pub OverlayKind);

struct NoopOverlay;

#[async_trait]
impl OverlayService for NoopOverlay {
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn health(&self) -> ServiceHealth {
        ServiceHealth::healthy()
    }
}

impl OverlayFactory for NoopOverlayFactory {
    fn new_service(&self, forwarding_address: &str) -> Result<Box<dyn OverlayService>> {
        tracing::debug!(overlay = %self.0, address = %forwarding_address, "no helper configured");
        Ok(Box::new(NoopOverlay))
    }
}

/// Runs an overlay as a helper process
#[derive(Debug, Clone)]
pub struct CommandOverlayFactory {
    kind: OverlayKind,
    command: Vec<String>,
}

impl CommandOverlayFactory {
    /// `command` is the helper program followed by its fixed arguments
    pub fn new(kind: OverlayKind, command: Vec<String>) -> Result<Self> {
        if command.first().map_or(true, |p| p.is_empty()) {
            return Err(AgentError::Config(sandlink_core::ConfigError::invalid(
                format!("overlay.{kind}"),
                "empty command",
            )));
        }
        Ok(Self { kind, command })
    }
}

impl OverlayFactory for CommandOverlayFactory {
    fn new_service(&self, forwarding_address: &str) -> Result<Box<dyn OverlayService>> {
        let program = &self.command[0];
        let mut child = Command::new(program)
            .args(&self.command[1..])
            .arg(forwarding_address)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::launch(program, e))?;

        let kind = self.kind;
        tracing::info!(overlay = %kind, address = %forwarding_address, pid = ?child.id(), "overlay helper started");

        let health = Arc::new(Mutex::new(ServiceHealth::healthy()));
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let task_health = Arc::clone(&health);
        tokio::spawn(async move {
            tokio::select! {
                _ = async { let _ = stop_rx.wait_for(|s| *s).await; } => {
                    if let Err(e) = child.kill().await {
                        tracing::debug!(overlay = %kind, error = %e, "overlay helper already gone");
                    }
                    task_health.lock().healthy = false;
                }
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!("{kind} overlay helper exited: {status}"),
                        Err(e) => format!("{kind} overlay helper wait failed: {e}"),
                    };
                    tracing::warn!(overlay = %kind, reason = %reason, "overlay helper stopped");
                    task_health.lock().record_error(reason);
                }
            }
            done_tx.send_replace(true);
        });

        Ok(Box::new(CommandOverlay {
            health,
            stop_tx,
            done_rx,
        }))
    }
}

struct CommandOverlay {
    health: Arc<Mutex<ServiceHealth>>,
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

#[async_trait]
impl OverlayService for CommandOverlay {
    async fn close(&self) -> Result<()> {
        self.stop_tx.send_replace(true);
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|d| *d).await;
        Ok(())
    }

    fn health(&self) -> ServiceHealth {
        self.health.lock().clone()
    }
}

impl Drop for CommandOverlay {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}
