//! `sandlink disconnect`

use anyhow::{bail, Result};
use std::convert::Infallible;
use std::time::Duration;
use tracing::debug;

use sandlink_agent::pidfile::live_pid;
use sandlink_readiness::{Check, Until, UntilError};

use crate::cli::Cli;
use crate::commands::{root_manager_client, sandbox_manager_client};

pub(crate) async fn disconnect(cli: &Cli, timeout: Duration) -> Result<()> {
    let paths = cli.paths();
    let root_pid_file = paths.root_manager_pid_file();
    let sandbox_pid_file = paths.sandbox_manager_pid_file();

    let root_pid = live_pid(&root_pid_file);
    let sandbox_pid = live_pid(&sandbox_pid_file);
    if root_pid.is_none() && sandbox_pid.is_none() {
        println!("Not connected");
        return Ok(());
    }

    // The root manager stops its sandbox manager itself.
    if root_pid.is_some() {
        if let Err(e) = root_manager_client(cli).shutdown().await {
            debug!(error = %e, "root manager shutdown request failed");
        }
    }
    if sandbox_pid.is_some() {
        if let Err(e) = sandbox_manager_client(cli).shutdown().await {
            debug!(error = %e, "sandbox manager shutdown request failed");
        }
    }

    let (root_file, sandbox_file) = (root_pid_file.as_path(), sandbox_pid_file.as_path());
    let waited = Until::new(timeout)
        .with_interval(Duration::from_millis(200))
        .run(|| async move {
            let running = live_pid(root_file).is_some() || live_pid(sandbox_file).is_some();
            Ok::<_, Infallible>(if running { Check::Pending } else { Check::Done(()) })
        })
        .await;

    match waited {
        Ok(()) => {
            println!("Disconnected");
            Ok(())
        }
        Err(UntilError::Timeout(_)) => {
            let still: Vec<String> = [live_pid(&root_pid_file), live_pid(&sandbox_pid_file)]
                .into_iter()
                .flatten()
                .map(|pid| pid.to_string())
                .collect();
            bail!(
                "Daemons still running after {}s (pid {})",
                timeout.as_secs(),
                still.join(", ")
            )
        }
        Err(UntilError::Failed(never)) => match never {},
    }
}
