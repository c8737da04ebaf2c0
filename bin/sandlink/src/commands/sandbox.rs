//! `sandlink sandbox ...`

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use sandlink_agent::rpc::ApplySandboxRequest;
use sandlink_agent::{AgentError, RpcCode};
use sandlink_readiness::{Check, Until, UntilError};

use crate::cli::Cli;
use crate::commands::sandbox_manager_client;

/// Read a sandbox definition (YAML or JSON) and work out its name
fn load_definition(file: &Path, name: Option<&str>) -> Result<ApplySandboxRequest> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    // YAML is a superset of JSON.
    let spec: serde_json::Value = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", file.display()))?;

    let name = match name {
        Some(name) => name.to_string(),
        None => spec
            .get("name")
            .and_then(|n| n.as_str())
            .map(str::to_string)
            .with_context(|| {
                format!("{} has no `name` field; pass --name", file.display())
            })?,
    };
    Ok(ApplySandboxRequest { name, spec })
}

fn explain(err: AgentError, name: &str) -> anyhow::Error {
    match err.rpc_code() {
        Some(RpcCode::NotFound) => anyhow!("Sandbox {name} not found: {err}"),
        Some(RpcCode::InvalidArgument) => anyhow!("Sandbox {name} rejected: {err}"),
        Some(RpcCode::Unavailable) => {
            anyhow!("Not connected or the API is unreachable; run `sandlink connect` ({err})")
        }
        _ => anyhow!(err).context(format!("Failed to apply sandbox {name}")),
    }
}

pub(crate) async fn apply(
    cli: &Cli,
    file: &Path,
    name: Option<&str>,
    wait: bool,
    timeout: Duration,
) -> Result<()> {
    let request = load_definition(file, name)?;
    let name = request.name.clone();
    let client = sandbox_manager_client(cli);

    info!(sandbox = %name, "applying sandbox");
    client
        .apply_sandbox(&request)
        .await
        .map_err(|e| explain(e, &name))?;
    println!("Sandbox {name} applied");

    if !wait {
        return Ok(());
    }

    let client = &client;
    let sandbox_name = name.as_str();
    let waited = Until::new(timeout)
        .with_interval(Duration::from_secs(1))
        .run(|| async move {
            match client.status().await {
                Ok(status) => match status.sandbox(sandbox_name) {
                    Some(sandbox) if sandbox.all_tunnels_up() => Ok(Check::Done(())),
                    Some(sandbox) => {
                        debug!(
                            up = sandbox.tunnels.iter().filter(|t| t.up).count(),
                            total = sandbox.tunnels.len(),
                            "waiting for tunnels"
                        );
                        Ok(Check::Pending)
                    }
                    None => Ok(Check::Pending),
                },
                Err(e) if e.rpc_code() == Some(RpcCode::Unavailable) => Ok(Check::Pending),
                Err(e) => Err(e),
            }
        })
        .await;

    match waited {
        Ok(()) => {
            println!("Sandbox {name} is ready");
            Ok(())
        }
        Err(UntilError::Timeout(t)) => Err(anyhow!(
            "Tunnels of sandbox {name} not up after {}s; see `sandlink status`",
            t.as_secs()
        )),
        Err(UntilError::Failed(e)) => Err(anyhow!(e).context("Failed to query status")),
    }
}
