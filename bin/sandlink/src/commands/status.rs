//! `sandlink status`

use anyhow::{Context, Result};
use sandlink_agent::rpc::StatusResponse;
use sandlink_agent::RpcCode;
use sandlink_core::{ConnectionConfig, ServiceHealth};

use crate::cli::Cli;
use crate::commands::sandbox_manager_client;

pub(crate) async fn status(cli: &Cli, json: bool) -> Result<()> {
    let status = match sandbox_manager_client(cli).status().await {
        Ok(status) => status,
        Err(e) if e.rpc_code() == Some(RpcCode::Unavailable) => {
            if json {
                println!("{}", serde_json::json!({ "connected": false }));
            } else {
                println!("Not connected");
            }
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to query the sandbox manager"),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("Failed to encode status")?
        );
    } else {
        print!("{}", render(&status));
    }
    Ok(())
}

fn health_line(name: &str, health: &ServiceHealth) -> String {
    let mut line = format!(
        "  {name:<14} {}",
        if health.healthy { "healthy" } else { "unhealthy" }
    );
    if let Some(reason) = &health.last_error_reason {
        line.push_str(&format!(" (errors: {}, last: {reason})", health.error_count));
    }
    line.push('\n');
    line
}

fn render(status: &StatusResponse) -> String {
    let config = &status.connection_config;
    let mut out = String::new();

    out.push_str(&format!("Cluster:     {} ({})\n", config.cluster, config.org));
    match &config.connection {
        ConnectionConfig::ProxyAddress { address } => {
            out.push_str(&format!("Connection:  proxy at {address}\n"));
        }
        ConnectionConfig::PortForward {
            kube_context,
            namespace,
            service,
            port,
        } => {
            out.push_str(&format!(
                "Connection:  port-forward {namespace}/svc/{service}:{port} (context {kube_context})\n"
            ));
        }
    }
    out.push_str(&format!(
        "Forwarding:  {}\n",
        status.forwarding_address.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!(
        "Health:      {}\n",
        if status.is_healthy() { "healthy" } else { "degraded" }
    ));

    out.push_str("Services:\n");
    if let Some(health) = &status.port_forward {
        out.push_str(&health_line("port-forward", health));
    }
    if config.with_root_manager {
        if let Some(health) = &status.network_overlay {
            out.push_str(&health_line("network", health));
        }
        if let Some(health) = &status.hosts {
            out.push_str(&health_line("hosts", health));
        }
    } else {
        out.push_str("  overlays       disabled (unprivileged)\n");
    }

    if status.sandboxes.is_empty() {
        out.push_str("Sandboxes:   none\n");
        return out;
    }
    out.push_str("Sandboxes:\n");
    for sandbox in &status.sandboxes {
        out.push_str(&format!("  {} [{}]\n", sandbox.name, sandbox.routing_key));
        for tunnel in &sandbox.tunnels {
            let state = match (tunnel.up, tunnel.remote_connected) {
                (true, true) => "connected",
                (true, false) => "up, waiting for remote",
                (false, _) => "down",
            };
            out.push_str(&format!("    {:<20} {state}", tunnel.workload));
            if let Some(err) = &tunnel.last_error {
                out.push_str(&format!(" ({err})"));
            }
            out.push('\n');
        }
    }
    out
}
