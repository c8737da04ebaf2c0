//! Sandbox controller
//!
//! A [`SandboxController`] reconciles the most recently received desired
//! [`Sandbox`] against the reverse tunnels it owns. Reconcile runs whenever
//! the desired state changes and on a fixed period as a safety net.
//!
//! With an API attached, the controller also follows the remote sandbox. Each
//! remote update refreshes the status of workloads whose spec is unchanged,
//! and a not-found error means the sandbox was deleted: the controller then
//! tears down its tunnels and exits as if stopped.
//!
//! The tunnel map holds only live, non-closing tunnels, so there is at most
//! one entry per workload name. Tunnels being closed are moved out of the map
//! under the lock and shut down after it is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use sandlink_api::{SandboxApi, WatchCode, WatchError};
use sandlink_core::{Sandbox, WorkloadSpec};
use sandlink_tunnel::{MonitorSettings, TunnelClient, TunnelConfig, TunnelMonitor};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::rpc::{SandboxStatus, TunnelState};

/// Timing of a [`SandboxController`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Period of the safety-net reconcile
    pub reconcile_interval: Duration,
    /// How long the remote side may report a tunnel as not connected
    /// before it is rebuilt
    pub disconnect_grace: Duration,
    /// Settings of each tunnel monitor
    pub monitor: MonitorSettings,
    /// First delay before re-opening a failed sandbox watch
    pub follow_backoff: Duration,
    /// Upper bound of the re-open delay
    pub follow_max_backoff: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            disconnect_grace: Duration::from_secs(10),
            monitor: MonitorSettings::default(),
            follow_backoff: Duration::from_secs(1),
            follow_max_backoff: Duration::from_secs(30),
        }
    }
}

/// Called once, from the controller task, after the controller has torn
/// down all of its tunnels. Receives the sandbox name and the generation the
/// controller was started with.
pub type DeletionCallback = Box<dyn FnOnce(&str, u64) + Send + 'static>;

struct TunnelEntry {
    monitor: TunnelMonitor,
    spec: WorkloadSpec,
    routing_key: String,
    disconnected_since: Option<Instant>,
}

struct ControllerState {
    desired: Sandbox,
    tunnels: HashMap<String, TunnelEntry>,
    closing: Vec<TunnelMonitor>,
}

impl ControllerState {
    /// Move a tunnel out of the live map and mark it for closure
    fn retire(&mut self, workload: &str) {
        if let Some(entry) = self.tunnels.remove(workload) {
            entry.monitor.close();
            self.closing.push(entry.monitor);
        }
    }
}

struct ControllerInner {
    name: String,
    user: String,
    client: Arc<dyn TunnelClient>,
    api: Option<Arc<dyn SandboxApi>>,
    settings: ControllerSettings,
    state: Mutex<ControllerState>,
}

impl ControllerInner {
    /// Take the remote status of workloads whose spec still matches
    fn refresh_status(&self, remote: &Sandbox) -> bool {
        let mut state = self.state.lock();
        if remote.routing_key != state.desired.routing_key {
            return false;
        }

        let mut changed = false;
        for workload in &mut state.desired.external_workloads {
            let Some(fresh) = remote.workload(&workload.name) else {
                continue;
            };
            if fresh.spec() == workload.spec() && fresh.status != workload.status {
                workload.status = fresh.status.clone();
                changed = true;
            }
        }
        changed
    }
}

/// Owns the reverse tunnels of one sandbox
pub struct SandboxController {
    inner: Arc<ControllerInner>,
    generation: u64,
    trigger_tx: mpsc::Sender<()>,
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl SandboxController {
    /// Start a controller for `sandbox`
    ///
    /// `user` identifies this machine in tunnel registrations. When `api` is
    /// set the controller follows the remote sandbox through it.
    pub fn start(
        sandbox: Sandbox,
        user: impl Into<String>,
        client: Arc<dyn TunnelClient>,
        api: Option<Arc<dyn SandboxApi>>,
        settings: ControllerSettings,
        generation: u64,
        on_deleted: DeletionCallback,
    ) -> Self {
        let inner = Arc::new(ControllerInner {
            name: sandbox.name.clone(),
            user: user.into(),
            client,
            api,
            settings,
            state: Mutex::new(ControllerState {
                desired: sandbox,
                tunnels: HashMap::new(),
                closing: Vec::new(),
            }),
        });

        // Size 1: back-to-back triggers collapse into one reconcile.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(run(
            Arc::clone(&inner),
            generation,
            trigger_tx.clone(),
            trigger_rx,
            stop_rx,
            done_tx,
            on_deleted,
        ));

        Self {
            inner,
            generation,
            trigger_tx,
            stop_tx,
            done_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the desired state
    ///
    /// Retained workloads whose spec or routing key changed lose their
    /// tunnel so the next reconcile builds a fresh one.
    pub fn update_sandbox(&self, desired: Sandbox) {
        {
            let mut state = self.inner.state.lock();
            let changed: Vec<String> = desired
                .external_workloads
                .iter()
                .filter(|w| {
                    state.tunnels.get(&w.name).is_some_and(|entry| {
                        entry.spec != w.spec() || entry.routing_key != desired.routing_key
                    })
                })
                .map(|w| w.name.clone())
                .collect();

            for workload in changed {
                tracing::info!(
                    sandbox = %self.inner.name,
                    workload = %workload,
                    "workload spec changed, rebuilding tunnel"
                );
                state.retire(&workload);
            }
            state.desired = desired;
        }
        self.trigger();
    }

    /// Request a reconcile; coalesces with one already pending
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Ask the controller to stop without waiting
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Tear down all tunnels and wait until the controller has exited
    ///
    /// Idempotent and safe to call concurrently. The deletion callback has
    /// run by the time this returns.
    pub async fn stop(&self) {
        self.request_stop();
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|d| *d).await;
    }

    pub fn is_finished(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Workload names with a live tunnel, sorted
    pub fn live_tunnels(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut names: Vec<String> = state.tunnels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn status(&self) -> SandboxStatus {
        let state = self.inner.state.lock();
        let tunnels = state
            .desired
            .external_workloads
            .iter()
            .map(|workload| {
                let tunnel = state.tunnels.get(&workload.name).map(|e| e.monitor.status());
                TunnelState {
                    workload: workload.name.clone(),
                    up: tunnel.as_ref().is_some_and(|t| t.up),
                    remote_connected: workload.status.connected,
                    last_error: tunnel.and_then(|t| t.last_error),
                }
            })
            .collect();

        SandboxStatus {
            name: self.inner.name.clone(),
            routing_key: state.desired.routing_key.clone(),
            tunnels,
        }
    }
}

impl Drop for SandboxController {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

async fn run(
    inner: Arc<ControllerInner>,
    generation: u64,
    trigger_tx: mpsc::Sender<()>,
    mut trigger_rx: mpsc::Receiver<()>,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    on_deleted: DeletionCallback,
) {
    let mut ticker = tokio::time::interval(inner.settings.reconcile_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let deleted = follow(&inner, trigger_tx);
    tokio::pin!(deleted);

    loop {
        tokio::select! {
            // The borrow from `wait_for` must not outlive the arm.
            _ = async { let _ = stop_rx.wait_for(|s| *s).await; } => break,
            () = &mut deleted => {
                tracing::info!(sandbox = %inner.name, "sandbox deleted remotely");
                break;
            }
            Some(()) = trigger_rx.recv() => reconcile(&inner).await,
            _ = ticker.tick() => reconcile(&inner).await,
        }
    }

    tracing::info!(sandbox = %inner.name, "stopping sandbox controller");
    {
        let mut state = inner.state.lock();
        state.desired = Sandbox::empty(inner.name.clone());
    }
    reconcile(&inner).await;

    on_deleted(&inner.name, generation);
    done_tx.send_replace(true);
    tracing::debug!(sandbox = %inner.name, generation, "sandbox controller exited");
}

/// Follow the remote sandbox; completes once it no longer exists
async fn follow(inner: &ControllerInner, trigger_tx: mpsc::Sender<()>) {
    let Some(api) = inner.api.as_ref() else {
        return std::future::pending::<()>().await;
    };
    let settings = &inner.settings;
    let mut backoff = settings.follow_backoff;

    loop {
        let err = match api.watch_sandbox(&inner.name).await {
            Ok(mut stream) => loop {
                match stream.next().await {
                    Some(Ok(remote)) => {
                        backoff = settings.follow_backoff;
                        if inner.refresh_status(&remote) {
                            let _ = trigger_tx.try_send(());
                        }
                    }
                    Some(Err(e)) => break e,
                    None => break WatchError::new(WatchCode::Unavailable, "sandbox watch closed"),
                }
            },
            Err(e) => e,
        };

        if err.code == WatchCode::NotFound {
            return;
        }
        tracing::debug!(
            sandbox = %inner.name,
            error = %err,
            backoff = ?backoff,
            "sandbox watch failed, retrying"
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(settings.follow_max_backoff);
    }
}

/// Converge the tunnel map on the desired state
async fn reconcile(inner: &ControllerInner) {
    let now = Instant::now();

    let closing = {
        let mut guard = inner.state.lock();
        let state = &mut *guard;

        let removed: Vec<String> = state
            .tunnels
            .keys()
            .filter(|name| state.desired.workload(name).is_none())
            .cloned()
            .collect();
        for workload in removed {
            tracing::info!(sandbox = %inner.name, workload = %workload, "closing tunnel of removed workload");
            state.retire(&workload);
        }

        let mut stuck = Vec::new();
        for workload in &state.desired.external_workloads {
            let Some(entry) = state.tunnels.get_mut(&workload.name) else {
                continue;
            };
            if workload.status.connected {
                entry.disconnected_since = None;
                continue;
            }
            let since = *entry.disconnected_since.get_or_insert(now);
            if now.duration_since(since) >= inner.settings.disconnect_grace {
                stuck.push(workload.name.clone());
            }
        }
        for workload in stuck {
            tracing::warn!(
                sandbox = %inner.name,
                workload = %workload,
                grace = ?inner.settings.disconnect_grace,
                "tunnel reported disconnected too long, rebuilding"
            );
            state.retire(&workload);
        }

        let ControllerState {
            desired,
            tunnels,
            closing,
        } = state;
        for workload in &desired.external_workloads {
            if tunnels.contains_key(&workload.name) {
                continue;
            }
            let config = TunnelConfig::for_workload(&desired.routing_key, workload, &inner.user);
            tracing::info!(sandbox = %inner.name, tunnel = %config.key(), "creating tunnel");
            let monitor = TunnelMonitor::start(
                Arc::clone(&inner.client),
                config,
                inner.settings.monitor,
            );
            tunnels.insert(
                workload.name.clone(),
                TunnelEntry {
                    monitor,
                    spec: workload.spec(),
                    routing_key: desired.routing_key.clone(),
                    disconnected_since: None,
                },
            );
        }

        std::mem::take(closing)
    };

    if !closing.is_empty() {
        futures_util::future::join_all(closing.iter().map(|m| m.shutdown())).await;
    }
}
