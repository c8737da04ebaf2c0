//! `sandlink connect`

use anyhow::{bail, Context, Result};
use nix::unistd::{Uid, User};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use parking_lot::Mutex;
use sandlink_agent::pidfile::live_pid;
use sandlink_agent::{ChildSpec, SudoLauncher, SANDBOX_MANAGER_SUBCOMMAND};
use sandlink_core::{
    CliConfig, ConnectInvocationConfig, ConnectionConfig, DowngradeUser, StatePaths,
    INVOCATION_CONFIG_ENV, INVOCATION_SCHEMA_VERSION,
};
use sandlink_readiness::{Evaluation, Readiness};

use crate::cli::{Cli, ConnectArgs};
use crate::commands::sandbox_manager_client;

const ROOT_MANAGER_SUBCOMMAND: &str = "root-manager";

pub(crate) async fn connect(cli: &Cli, args: &ConnectArgs) -> Result<()> {
    let paths = cli.paths();
    if let Some(pid) = live_pid(&paths.sandbox_manager_pid_file())
        .or_else(|| live_pid(&paths.root_manager_pid_file()))
    {
        bail!("Already connected (daemon pid {pid}); run `sandlink disconnect` first");
    }

    let file_config = CliConfig::load(&paths.config_file())
        .with_context(|| format!("Failed to load {}", paths.config_file().display()))?;
    let config = invocation_config(cli, args, &file_config, &paths)?;
    let program = std::env::current_exe().context("Cannot resolve the sandlink binary path")?;

    let child = if config.with_root_manager {
        start_root_manager(&program, &config)?
    } else {
        start_detached(
            ChildSpec::new(&program)
                .arg(SANDBOX_MANAGER_SUBCOMMAND)
                .env(INVOCATION_CONFIG_ENV, config.to_env_value()?),
        )?
    };
    info!(pid = child.id(), root_manager = config.with_root_manager, "daemon started");

    if !args.wait {
        println!(
            "Connecting to cluster {}; run `sandlink status` to follow progress",
            config.cluster
        );
        return Ok(());
    }

    wait_until_healthy(cli, child, Duration::from_secs(args.timeout_secs)).await?;
    println!("Connected to cluster {}", config.cluster);
    Ok(())
}

/// Merge flags, environment and the config file into one invocation config
fn invocation_config(
    cli: &Cli,
    args: &ConnectArgs,
    file: &CliConfig,
    paths: &StatePaths,
) -> Result<ConnectInvocationConfig> {
    let api_url = args
        .api_url
        .clone()
        .or_else(|| file.api_url.clone())
        .context("No API URL configured (--api-url or apiUrl in config.yaml)")?;
    let api_key = args
        .api_key
        .clone()
        .or_else(|| file.api_key.clone())
        .context("No API key configured (--api-key or apiKey in config.yaml)")?;
    let org = args
        .org
        .clone()
        .or_else(|| file.org.clone())
        .context("No organization configured (--org or org in config.yaml)")?;
    let cluster = args
        .cluster
        .clone()
        .or_else(|| file.local.cluster.clone())
        .context("No cluster configured (--cluster or local.cluster in config.yaml)")?;

    let connection = match (&args.proxy_address, &args.kube_context) {
        (Some(address), _) => ConnectionConfig::ProxyAddress {
            address: address.clone(),
        },
        (None, Some(context)) => ConnectionConfig::port_forward(context.clone()),
        (None, None) => file.local.connection.clone().context(
            "No connection configured (--proxy-address, --kube-context or local.connection)",
        )?,
    };

    let config = ConnectInvocationConfig {
        schema_version: INVOCATION_SCHEMA_VERSION,
        api_url,
        api_key,
        org,
        cluster,
        connection,
        with_root_manager: !(args.unprivileged || file.local.unprivileged),
        sandbox_manager_port: cli.sandbox_manager_port,
        root_manager_port: cli.root_manager_port,
        user: downgrade_user()?,
        state_dir: paths.root().to_path_buf(),
        debug: cli.verbose > 0,
        overlay: file.local.overlay.clone(),
    };
    config.validate()?;
    Ok(config)
}

/// The user the sandbox manager runs as: the invoking user, even under sudo
fn downgrade_user() -> Result<DowngradeUser> {
    let uid = match std::env::var("SUDO_UID") {
        Ok(uid) if Uid::effective().is_root() => Uid::from_raw(
            uid.parse()
                .with_context(|| format!("Invalid SUDO_UID '{uid}'"))?,
        ),
        _ => Uid::current(),
    };
    let user = User::from_uid(uid)
        .context("Failed to look up the current user")?
        .with_context(|| format!("No passwd entry for uid {uid}"))?;
    Ok(DowngradeUser {
        name: user.name,
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        home: user.dir,
    })
}

fn start_root_manager(program: &Path, config: &ConnectInvocationConfig) -> Result<Child> {
    let spec = ChildSpec::new(program)
        .arg(ROOT_MANAGER_SUBCOMMAND)
        .env(INVOCATION_CONFIG_ENV, config.to_env_value()?);
    if Uid::effective().is_root() {
        return start_detached(spec);
    }

    // Prompt for credentials in the foreground; the detached start is non-interactive.
    let status = Command::new("sudo")
        .arg("-v")
        .status()
        .context("Failed to run sudo")?;
    if !status.success() {
        bail!("sudo authentication failed; the root manager needs root privileges");
    }

    let mut sudo = ChildSpec::new("sudo");
    for arg in SudoLauncher::new("root").sudo_args(&spec) {
        sudo = sudo.arg(arg);
    }
    sudo.env = spec.env;
    start_detached(sudo)
}

/// Start a daemon in its own process group, detached from the terminal
fn start_detached(spec: ChildSpec) -> Result<Child> {
    debug!(program = %spec.program.display(), args = ?spec.args, "starting daemon");
    Command::new(&spec.program)
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .with_context(|| format!("Failed to start {}", spec.program.display()))
}

async fn wait_until_healthy(cli: &Cli, child: Child, timeout: Duration) -> Result<()> {
    let client = Arc::new(sandbox_manager_client(cli).with_timeout(Duration::from_secs(3)));
    let child = Arc::new(Mutex::new(child));

    let readiness = Readiness::spawn(Duration::from_secs(1), move || {
        let client = Arc::clone(&client);
        let child = Arc::clone(&child);
        async move {
            let exited = child.lock().try_wait();
            if let Ok(Some(status)) = exited {
                return Evaluation::fatal(format!("daemon exited during startup ({status})"));
            }
            match client.status().await {
                Ok(status) if status.is_healthy() => Evaluation::ready(),
                Ok(status) => {
                    debug!(
                        forwarding = ?status.forwarding_address,
                        root_manager = status.root_manager_reachable,
                        "not healthy yet"
                    );
                    Evaluation::not_ready()
                }
                Err(e) => Evaluation::warning(e),
            }
        }
    });

    let deadline = tokio::time::Instant::now() + timeout;
    let outcome = loop {
        if readiness.is_ready() {
            break Ok(());
        }
        if let Some(err) = readiness.fatal() {
            break Err(anyhow::anyhow!(err));
        }
        while let Some(warning) = readiness.warn() {
            debug!(error = %warning, "waiting for daemons");
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(timeout = ?timeout, "connection not healthy in time");
            break Err(anyhow::anyhow!(
                "Connection not healthy after {}s; see `sandlink status`",
                timeout.as_secs()
            ));
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    };
    readiness.stop().await;
    outcome
}
