use clap::{Args, Parser, Subcommand};
use sandlink_core::{StatePaths, DEFAULT_ROOT_MANAGER_PORT, DEFAULT_SANDBOX_MANAGER_PORT};
use std::path::PathBuf;

/// Connect this machine to remote sandboxes
#[derive(Parser)]
#[command(name = "sandlink")]
#[command(version, about = "Connect this machine to remote sandboxes")]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// State directory (PID files, logs, config.yaml)
    #[arg(long, env = "SANDLINK_HOME", global = true)]
    pub(crate) state_dir: Option<PathBuf>,

    /// Loopback port of the sandbox manager
    #[arg(long, env = "SANDLINK_SANDBOX_MANAGER_PORT", global = true, default_value_t = DEFAULT_SANDBOX_MANAGER_PORT)]
    pub(crate) sandbox_manager_port: u16,

    /// Loopback port of the root manager
    #[arg(long, env = "SANDLINK_ROOT_MANAGER_PORT", global = true, default_value_t = DEFAULT_ROOT_MANAGER_PORT)]
    pub(crate) root_manager_port: u16,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub(crate) verbose: u8,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

impl Cli {
    pub(crate) fn paths(&self) -> StatePaths {
        StatePaths::new(
            self.state_dir
                .clone()
                .unwrap_or_else(StatePaths::default_root),
        )
    }
}

/// CLI subcommands
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start the local daemons and connect to the cluster
    Connect(ConnectArgs),

    /// Stop the local daemons
    Disconnect {
        /// Seconds to wait for the daemons to exit
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Show connection and tunnel status
    Status {
        /// Print the raw status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage sandboxes
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommands,
    },

    /// Run the sandbox manager daemon
    #[command(hide = true)]
    SandboxManager,

    /// Run the root manager daemon
    #[command(hide = true)]
    RootManager,
}

#[derive(Args)]
pub(crate) struct ConnectArgs {
    /// Remote API base URL
    #[arg(long, env = "SANDLINK_API_URL")]
    pub(crate) api_url: Option<String>,

    /// Remote API key
    #[arg(long, env = "SANDLINK_API_KEY", hide_env_values = true)]
    pub(crate) api_key: Option<String>,

    /// Organization
    #[arg(long, env = "SANDLINK_ORG")]
    pub(crate) org: Option<String>,

    /// Cluster to connect to
    #[arg(long)]
    pub(crate) cluster: Option<String>,

    /// Reach the tunnel proxy directly at host:port
    #[arg(long, conflicts_with = "kube_context")]
    pub(crate) proxy_address: Option<String>,

    /// Reach the tunnel proxy through kubectl port-forward in this context
    #[arg(long)]
    pub(crate) kube_context: Option<String>,

    /// Run without the privileged root manager (no network or hosts overlay)
    #[arg(long)]
    pub(crate) unprivileged: bool,

    /// Wait until the connection is healthy
    #[arg(long)]
    pub(crate) wait: bool,

    /// Seconds to wait with --wait
    #[arg(long, default_value_t = 120)]
    pub(crate) timeout_secs: u64,
}

#[derive(Subcommand)]
pub(crate) enum SandboxCommands {
    /// Create or update a sandbox from a YAML or JSON file
    Apply {
        /// Sandbox definition
        #[arg(short = 'f', long)]
        file: PathBuf,

        /// Sandbox name (defaults to the file's `name` field)
        #[arg(long)]
        name: Option<String>,

        /// Wait until all of the sandbox's tunnels are up
        #[arg(long)]
        wait: bool,

        /// Seconds to wait with --wait
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sandbox_apply() {
        let cli = Cli::try_parse_from([
            "sandlink",
            "sandbox",
            "apply",
            "-f",
            "sb.yaml",
            "--wait",
            "--state-dir",
            "/tmp/s",
        ])
        .unwrap();
        assert_eq!(cli.paths().root(), std::path::Path::new("/tmp/s"));
        match cli.command {
            Commands::Sandbox {
                command: SandboxCommands::Apply { file, wait, .. },
            } => {
                assert_eq!(file, PathBuf::from("sb.yaml"));
                assert!(wait);
            }
            _ => panic!("expected sandbox apply"),
        }
    }

    #[test]
    fn test_proxy_and_kube_context_conflict() {
        let parsed = Cli::try_parse_from([
            "sandlink",
            "connect",
            "--proxy-address",
            "127.0.0.1:1080",
            "--kube-context",
            "kind",
        ]);
        assert!(parsed.is_err());
    }
}
