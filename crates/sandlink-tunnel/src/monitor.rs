//! Reverse-tunnel monitor
//!
//! A [`TunnelMonitor`] keeps exactly one tunnel alive for one external
//! workload. Setup is attempted with a bounded timeout; failures are retried
//! after a fixed delay, forever, so that network partitions heal on their own.
//! A tunnel closed by the remote end is rebuilt. Only an explicit close ends
//! the monitor.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{EstablishedTunnel, TunnelClient, TunnelConfig, TunnelError, TunnelKey};

/// Timing of a [`TunnelMonitor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Upper bound on one setup attempt
    pub setup_timeout: Duration,
    /// Delay between a failed attempt and the next one
    pub retry_delay: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Snapshot of a monitor's tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStatus {
    /// Whether a tunnel is currently established
    pub up: bool,
    /// Number of successful setups so far
    pub setups: u32,
    /// Most recent setup error, cleared on success
    pub last_error: Option<String>,
}

/// Owns the lifecycle of one reverse tunnel
///
/// Dropping the monitor asks it to close without waiting.
pub struct TunnelMonitor {
    key: TunnelKey,
    status: Arc<Mutex<TunnelStatus>>,
    close_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl TunnelMonitor {
    /// Start monitoring a tunnel for `config`
    pub fn start(
        client: Arc<dyn TunnelClient>,
        config: TunnelConfig,
        settings: MonitorSettings,
    ) -> Self {
        let key = config.key();
        let status = Arc::new(Mutex::new(TunnelStatus::default()));
        let (close_tx, close_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let loop_status = Arc::clone(&status);
        tokio::spawn(async move {
            run(client, config, settings, loop_status, close_rx).await;
            done_tx.send_replace(true);
        });

        Self {
            key,
            status,
            close_tx,
            done_rx,
        }
    }

    #[must_use]
    pub fn key(&self) -> &TunnelKey {
        &self.key
    }

    /// Ask the monitor to close its tunnel and exit; does not wait
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Whether [`Self::close`] has been called
    #[must_use]
    pub fn is_closing(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Whether the monitor task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Close and wait until the monitor has exited
    pub async fn shutdown(&self) {
        self.close();
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|d| *d).await;
    }

    #[must_use]
    pub fn status(&self) -> TunnelStatus {
        self.status.lock().clone()
    }
}

impl Drop for TunnelMonitor {
    fn drop(&mut self) {
        self.close_tx.send_replace(true);
    }
}

async fn run(
    client: Arc<dyn TunnelClient>,
    config: TunnelConfig,
    settings: MonitorSettings,
    status: Arc<Mutex<TunnelStatus>>,
    mut close_rx: watch::Receiver<bool>,
) {
    let key = config.key();

    loop {
        let attempt = tokio::select! {
            _ = close_rx.wait_for(|c| *c) => break,
            attempt = tokio::time::timeout(settings.setup_timeout, client.setup(&config)) => attempt,
        };

        let EstablishedTunnel { closer, closed } = match attempt {
            Ok(Ok(tunnel)) => tunnel,
            Ok(Err(e)) => {
                record_failure(&status, &key, &e);
                if wait_or_close(&mut close_rx, settings.retry_delay).await {
                    break;
                }
                continue;
            }
            Err(_) => {
                record_failure(&status, &key, &TunnelError::Timeout);
                if wait_or_close(&mut close_rx, settings.retry_delay).await {
                    break;
                }
                continue;
            }
        };

        {
            let mut status = status.lock();
            status.up = true;
            status.setups = status.setups.saturating_add(1);
            status.last_error = None;
        }
        tracing::info!(tunnel = %key, "tunnel up");

        tokio::select! {
            _ = close_rx.wait_for(|c| *c) => {
                closer.close();
                status.lock().up = false;
                tracing::info!(tunnel = %key, "tunnel closed");
                break;
            }
            _ = closed => {
                status.lock().up = false;
                tracing::warn!(tunnel = %key, "tunnel closed by remote, re-establishing");
            }
        }
    }

    tracing::debug!(tunnel = %key, "tunnel monitor exited");
}

fn record_failure(status: &Mutex<TunnelStatus>, key: &TunnelKey, err: &TunnelError) {
    tracing::warn!(tunnel = %key, error = %err, "tunnel setup failed, retrying");
    let mut status = status.lock();
    status.up = false;
    status.last_error = Some(err.to_string());
}

/// Sleep for `delay`; returns true if a close arrived first
async fn wait_or_close(close_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = close_rx.wait_for(|c| *c) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
