//! Hidden entrypoints of the two daemons
//!
//! Both read their configuration from the invocation config environment
//! variable set by `connect` (or by the root manager for its child).

use anyhow::{Context, Result};
use nix::unistd::Uid;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

use sandlink_agent::{
    run_root_manager, run_sandbox_manager, DirectLauncher, ProcessLauncher,
    RootManagerSettings, SandboxManagerSettings, SudoLauncher,
};
use sandlink_core::{ConnectInvocationConfig, StatePaths};
use sandlink_observability::{init_logging, LogGuard, LoggingConfig};

fn load(name: &str) -> Result<(ConnectInvocationConfig, LogGuard)> {
    let config = ConnectInvocationConfig::from_env().context("Invalid invocation config")?;
    let paths = StatePaths::new(&config.state_dir);
    let guard = init_logging(&LoggingConfig::daemon(name, paths.log_dir(), config.debug))
        .context("Failed to initialize logging")?;
    info!(config = ?config.redacted(), "{name} configuration loaded");
    Ok((config, guard))
}

/// Treat SIGINT and SIGTERM like a `Shutdown` call
fn forward_signals(shutdown: watch::Sender<bool>) -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => info!("SIGTERM received, shutting down"),
            _ = interrupt.recv() => info!("SIGINT received, shutting down"),
        }
        shutdown.send_replace(true);
    });
    Ok(())
}

pub(crate) async fn sandbox_manager() -> Result<()> {
    let (config, _guard) = load("sandbox-manager")?;
    let (shutdown_tx, _) = watch::channel(false);
    forward_signals(shutdown_tx.clone())?;

    run_sandbox_manager(config, SandboxManagerSettings::default(), shutdown_tx)
        .await
        .context("Sandbox manager failed")
}

pub(crate) async fn root_manager() -> Result<()> {
    let (config, _guard) = load("root-manager")?;
    let program = std::env::current_exe().context("Cannot resolve the sandlink binary path")?;

    let launcher: Arc<dyn ProcessLauncher> = if Uid::effective().as_raw() == config.user.uid {
        Arc::new(DirectLauncher)
    } else {
        Arc::new(SudoLauncher::new(config.user.name.clone()))
    };

    let (shutdown_tx, _) = watch::channel(false);
    forward_signals(shutdown_tx.clone())?;

    run_root_manager(
        config,
        program,
        launcher,
        RootManagerSettings::default(),
        shutdown_tx,
    )
    .await
    .context("Root manager failed")
}
