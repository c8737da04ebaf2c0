//! `kubectl port-forward` to the cluster's tunnel proxy
//!
//! The sandbox manager owns one [`PortForward`] when the connection is
//! configured as a port-forward. The local port is chosen by kubectl and
//! published on a watch channel as the forwarding address, so tunnel clients
//! and the root manager follow restarts onto a new port.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sandlink_core::ServiceHealth;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

/// Timing and program of a [`PortForward`]
#[derive(Debug, Clone)]
pub struct PortForwardSettings {
    pub kubectl: PathBuf,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PortForwardSettings {
    fn default() -> Self {
        Self {
            kubectl: PathBuf::from("kubectl"),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// What to forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardTarget {
    pub kube_context: String,
    pub namespace: String,
    pub service: String,
    pub port: u16,
}

impl PortForwardTarget {
    /// kubectl arguments; the local port is left for kubectl to pick
    pub fn kubectl_args(&self) -> Vec<String> {
        vec![
            "--context".to_string(),
            self.kube_context.clone(),
            "--namespace".to_string(),
            self.namespace.clone(),
            "port-forward".to_string(),
            format!("svc/{}", self.service),
            format!(":{}", self.port),
        ]
    }
}

/// Extract the local IPv4 address from a kubectl output line
///
/// kubectl prints `Forwarding from 127.0.0.1:40123 -> 1080` once the
/// listener is up (and a similar line for `[::1]`, which is ignored).
pub fn parse_forwarding_line(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix("Forwarding from ")?;
    let address = rest.split_whitespace().next()?;
    let port = address.strip_prefix("127.0.0.1:")?;
    port.parse::<u16>().ok()?;
    Some(address.to_string())
}

/// A supervised port-forward
pub struct PortForward {
    health: Arc<Mutex<ServiceHealth>>,
    address: watch::Receiver<Option<String>>,
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl PortForward {
    /// Start supervising the port-forward
    pub fn start(target: PortForwardTarget, settings: PortForwardSettings) -> Self {
        let health = Arc::new(Mutex::new(ServiceHealth::default()));
        let (address_tx, address) = watch::channel(None);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(supervise(
            target,
            settings,
            Arc::clone(&health),
            address_tx,
            stop_rx,
            done_tx,
        ));

        Self {
            health,
            address,
            stop_tx,
            done_rx,
        }
    }

    /// Forwarding address, `None` while the port-forward is down
    pub fn address(&self) -> watch::Receiver<Option<String>> {
        self.address.clone()
    }

    pub fn health(&self) -> ServiceHealth {
        self.health.lock().clone()
    }

    /// Stop the port-forward and wait for kubectl to exit
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|d| *d).await;
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

async fn supervise(
    target: PortForwardTarget,
    settings: PortForwardSettings,
    health: Arc<Mutex<ServiceHealth>>,
    address_tx: watch::Sender<Option<String>>,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
) {
    let mut backoff = settings.initial_backoff;

    while !*stop_rx.borrow() {
        let mut child = match Command::new(&settings.kubectl)
            .args(target.kubectl_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("failed to start port-forward: {e}");
                tracing::warn!(service = %target.service, reason = %reason, "port-forward failed");
                health.lock().record_error(reason);
                if sleep_or_stop(backoff, &mut stop_rx).await {
                    break;
                }
                backoff = (backoff * 2).min(settings.max_backoff);
                continue;
            }
        };
        tracing::debug!(service = %target.service, pid = ?child.id(), "port-forward started");

        let mut lines = child.stdout.take().map(|out| BufReader::new(out).lines());
        let stopped = loop {
            tokio::select! {
                _ = stop_rx.wait_for(|s| *s) => break true,
                line = next_line(&mut lines) => match line {
                    Some(line) => {
                        if let Some(address) = parse_forwarding_line(&line) {
                            tracing::info!(address = %address, "port-forward ready");
                            health.lock().record_success();
                            address_tx.send_replace(Some(address));
                            backoff = settings.initial_backoff;
                        }
                    }
                    // Output closed; kubectl is exiting.
                    None => break false,
                },
            }
        };

        address_tx.send_replace(None);
        if stopped {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "port-forward already exited");
            }
            break;
        }

        let reason = match child.wait().await {
            Ok(status) => format!("port-forward exited: {status}"),
            Err(e) => format!("port-forward wait failed: {e}"),
        };
        tracing::warn!(service = %target.service, reason = %reason, retry_in = ?backoff, "port-forward lost");
        health.lock().record_error(reason);

        if sleep_or_stop(backoff, &mut stop_rx).await {
            break;
        }
        backoff = (backoff * 2).min(settings.max_backoff);
    }

    health.lock().healthy = false;
    done_tx.send_replace(true);
}

async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<tokio::process::ChildStdout>>>,
) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

/// Sleep for `delay`; true if stop was requested meanwhile
async fn sleep_or_stop(delay: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = stop_rx.wait_for(|s| *s) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_forwarding_line() {
        assert_eq!(
            parse_forwarding_line("Forwarding from 127.0.0.1:40123 -> 1080"),
            Some("127.0.0.1:40123".to_string())
        );
        assert_eq!(parse_forwarding_line("Forwarding from [::1]:40123 -> 1080"), None);
        assert_eq!(parse_forwarding_line("Handling connection for 40123"), None);
        assert_eq!(parse_forwarding_line("Forwarding from 127.0.0.1:x -> 1080"), None);
    }

    #[test]
    fn test_kubectl_args() {
        let target = PortForwardTarget {
            kube_context: "dev".to_string(),
            namespace: "sandlink".to_string(),
            service: "tunnel-proxy".to_string(),
            port: 1080,
        };
        assert_eq!(
            target.kubectl_args(),
            vec![
                "--context",
                "dev",
                "--namespace",
                "sandlink",
                "port-forward",
                "svc/tunnel-proxy",
                ":1080"
            ]
        );
    }

    fn fake_kubectl(dir: &std::path::Path, script: &str) -> PathBuf {
        let path = dir.join("kubectl");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn target() -> PortForwardTarget {
        PortForwardTarget {
            kube_context: "dev".to_string(),
            namespace: "sandlink".to_string(),
            service: "tunnel-proxy".to_string(),
            port: 1080,
        }
    }

    #[tokio::test]
    async fn test_publishes_address_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = fake_kubectl(
            dir.path(),
            "echo 'Forwarding from 127.0.0.1:40123 -> 1080'\nexec sleep 30",
        );
        let pf = PortForward::start(
            target(),
            PortForwardSettings {
                kubectl,
                ..PortForwardSettings::default()
            },
        );

        let mut address = pf.address();
        tokio::time::timeout(Duration::from_secs(5), address.wait_for(|a| a.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(address.borrow().as_deref(), Some("127.0.0.1:40123"));
        assert!(pf.health().healthy);

        tokio::time::timeout(Duration::from_secs(5), pf.stop()).await.unwrap();
        pf.stop().await;
        assert!(address.borrow().is_none());
        assert!(!pf.health().healthy);
    }

    #[tokio::test]
    async fn test_exit_recorded_and_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = fake_kubectl(dir.path(), "echo 'error: no context'\nexit 1");
        let pf = PortForward::start(
            target(),
            PortForwardSettings {
                kubectl,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(20),
            },
        );

        for _ in 0..500 {
            if pf.health().error_count >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let health = pf.health();
        assert!(!health.healthy);
        assert!(health.error_count >= 2);
        assert!(health
            .last_error_reason
            .unwrap()
            .starts_with("port-forward exited"));
        pf.stop().await;
    }
}
