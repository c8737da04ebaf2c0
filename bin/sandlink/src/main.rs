//! sandlink CLI
//!
//! Connects this machine to remote sandboxes. The same binary also runs the
//! two local daemons through hidden subcommands.

mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;

use sandlink_observability::{init_logging, LoggingConfig};

use crate::cli::{Cli, Commands, SandboxCommands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Daemons set up their own logging once their config is decoded.
    let _guard = match cli.command {
        Commands::SandboxManager | Commands::RootManager => None,
        _ => Some(
            init_logging(&LoggingConfig::cli(cli.verbose))
                .context("Failed to initialize logging")?,
        ),
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Connect(args) => commands::connect::connect(&cli, args).await,
        Commands::Disconnect { timeout_secs } => {
            commands::disconnect::disconnect(&cli, Duration::from_secs(*timeout_secs)).await
        }
        Commands::Status { json } => commands::status::status(&cli, *json).await,
        Commands::Sandbox { command } => match command {
            SandboxCommands::Apply {
                file,
                name,
                wait,
                timeout_secs,
            } => {
                commands::sandbox::apply(
                    &cli,
                    file,
                    name.as_deref(),
                    *wait,
                    Duration::from_secs(*timeout_secs),
                )
                .await
            }
        },
        Commands::SandboxManager => commands::daemon::sandbox_manager().await,
        Commands::RootManager => commands::daemon::root_manager().await,
    }
}
