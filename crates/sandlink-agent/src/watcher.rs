//! Sandbox watcher
//!
//! Keeps one [`SandboxController`] per sandbox that references this
//! machine, following the remote watch stream. Every event carries the full
//! current set; controllers absent from it are stopped.
//!
//! Removal is two-step: the watcher only asks a controller to stop, and the
//! controller's deletion callback removes it from the registry once its
//! tunnels are gone. The callback checks the generation it was started with,
//! so a controller that finishes late cannot remove its successor. An update
//! for a sandbox whose controller is still stopping is parked and used to
//! start a fresh controller when the old one is gone.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use sandlink_api::{SandboxApi, WatchCode, WatchError};
use sandlink_core::Sandbox;
use sandlink_tunnel::TunnelClient;
use tokio::sync::{watch, Notify};

use crate::controller::{ControllerSettings, SandboxController};
use crate::rpc::SandboxStatus;

/// Timing of a [`SandboxWatcher`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherSettings {
    /// First delay before re-opening a failed watch
    pub initial_backoff: Duration,
    /// Upper bound of the re-open delay
    pub max_backoff: Duration,
    /// Settings of each controller
    pub controller: ControllerSettings,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            controller: ControllerSettings::default(),
        }
    }
}

struct ControllerSlot {
    controller: Arc<SandboxController>,
    generation: u64,
    stopping: bool,
}

#[derive(Default)]
struct Registry {
    controllers: HashMap<String, ControllerSlot>,
    pending: HashMap<String, Sandbox>,
}

struct WatcherInner {
    api: Arc<dyn SandboxApi>,
    client: Arc<dyn TunnelClient>,
    machine_id: String,
    settings: WatcherSettings,
    registry: Mutex<Registry>,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
    /// Notified every time a controller leaves the registry
    drained: Notify,
}

/// Maintains the set of sandbox controllers
#[derive(Clone)]
pub struct SandboxWatcher {
    inner: Arc<WatcherInner>,
}

impl SandboxWatcher {
    pub fn new(
        api: Arc<dyn SandboxApi>,
        client: Arc<dyn TunnelClient>,
        machine_id: impl Into<String>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                api,
                client,
                machine_id: machine_id.into(),
                settings,
                registry: Mutex::new(Registry::default()),
                next_generation: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
                drained: Notify::new(),
            }),
        }
    }

    /// Apply one watch event: the complete set of desired sandboxes
    pub fn apply_event(&self, sandboxes: Vec<Sandbox>) {
        let desired: HashSet<String> = sandboxes.iter().map(|s| s.name.clone()).collect();
        let mut to_stop = Vec::new();
        {
            let mut registry = self.inner.registry.lock();
            for sandbox in sandboxes {
                self.inner.upsert(&mut registry, sandbox);
            }
            registry.pending.retain(|name, _| desired.contains(name));

            for (name, slot) in registry.controllers.iter_mut() {
                if !desired.contains(name) && !slot.stopping {
                    tracing::info!(sandbox = %name, "sandbox no longer references this machine");
                    slot.stopping = true;
                    to_stop.push(Arc::clone(&slot.controller));
                }
            }
        }

        for controller in to_stop {
            // The deletion callback removes it from the registry.
            controller.request_stop();
        }
    }

    /// Start or update the controller of one sandbox, leaving others alone
    pub fn register_sandbox(&self, sandbox: Sandbox) {
        let mut registry = self.inner.registry.lock();
        self.inner.upsert(&mut registry, sandbox);
    }

    /// Follow the remote watch stream until `shutdown` is set
    ///
    /// Transient stream errors are retried with exponential backoff. A
    /// terminal error ends the watch and tears down every controller, as if
    /// no sandbox referenced this machine any more.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let settings = self.inner.settings;
        let mut backoff = settings.initial_backoff;

        loop {
            let opened = tokio::select! {
                _ = shutdown.wait_for(|s| *s) => return,
                opened = self.inner.api.watch_local_sandboxes(&self.inner.machine_id) => opened,
            };

            let err = match opened {
                Ok(mut stream) => {
                    tracing::info!("sandbox watch established");
                    loop {
                        let next = tokio::select! {
                            _ = shutdown.wait_for(|s| *s) => return,
                            next = stream.next() => next,
                        };
                        match next {
                            Some(Ok(sandboxes)) => {
                                backoff = settings.initial_backoff;
                                tracing::debug!(count = sandboxes.len(), "sandbox watch event");
                                self.apply_event(sandboxes);
                            }
                            Some(Err(e)) => break e,
                            None => {
                                break WatchError::new(WatchCode::Unavailable, "watch stream closed")
                            }
                        }
                    }
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                tracing::warn!(code = ?err.code, error = %err.message, "sandbox watch ended");
                self.apply_event(Vec::new());
                return;
            }

            tracing::warn!(
                code = ?err.code,
                error = %err.message,
                retry_in = ?backoff,
                "sandbox watch failed, retrying"
            );
            tokio::select! {
                _ = shutdown.wait_for(|s| *s) => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = std::cmp::min(backoff.saturating_mul(2), settings.max_backoff);
        }
    }

    /// Stop every controller and wait until all have torn down their tunnels
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let controllers: Vec<Arc<SandboxController>> = {
            let mut registry = self.inner.registry.lock();
            registry.pending.clear();
            registry
                .controllers
                .values_mut()
                .map(|slot| {
                    slot.stopping = true;
                    Arc::clone(&slot.controller)
                })
                .collect()
        };

        tracing::info!(count = controllers.len(), "stopping sandbox controllers");
        for controller in &controllers {
            controller.request_stop();
        }

        // Count down until the registry is empty.
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.inner.registry.lock().controllers.is_empty() {
                break;
            }
            drained.await;
        }
        tracing::info!("all sandbox controllers stopped");
    }

    /// Status of every active controller, sorted by sandbox name
    pub fn statuses(&self) -> Vec<SandboxStatus> {
        let controllers: Vec<Arc<SandboxController>> = {
            let registry = self.inner.registry.lock();
            registry
                .controllers
                .values()
                .filter(|slot| !slot.stopping)
                .map(|slot| Arc::clone(&slot.controller))
                .collect()
        };
        let mut statuses: Vec<SandboxStatus> = controllers.iter().map(|c| c.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Names of sandboxes with a registered controller, sorted
    pub fn sandbox_names(&self) -> Vec<String> {
        let registry = self.inner.registry.lock();
        let mut names: Vec<String> = registry.controllers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Controller of one sandbox, if registered and not stopping
    pub fn controller(&self, name: &str) -> Option<Arc<SandboxController>> {
        let registry = self.inner.registry.lock();
        registry
            .controllers
            .get(name)
            .filter(|slot| !slot.stopping)
            .map(|slot| Arc::clone(&slot.controller))
    }
}

impl WatcherInner {
    fn upsert(self: &Arc<Self>, registry: &mut Registry, sandbox: Sandbox) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        match registry.controllers.get(&sandbox.name) {
            Some(slot) if !slot.stopping => slot.controller.update_sandbox(sandbox),
            Some(_) => {
                tracing::debug!(sandbox = %sandbox.name, "controller still stopping, parking update");
                registry.pending.insert(sandbox.name.clone(), sandbox);
            }
            None => self.spawn_controller(registry, sandbox),
        }
    }

    fn spawn_controller(self: &Arc<Self>, registry: &mut Registry, sandbox: Sandbox) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let name = sandbox.name.clone();
        let weak: Weak<WatcherInner> = Arc::downgrade(self);

        tracing::info!(sandbox = %name, generation, "starting sandbox controller");
        let controller = SandboxController::start(
            sandbox,
            self.machine_id.clone(),
            Arc::clone(&self.client),
            Some(Arc::clone(&self.api)),
            self.settings.controller,
            generation,
            Box::new(move |name, generation| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_controller_deleted(name, generation);
                }
            }),
        );

        registry.controllers.insert(
            name,
            ControllerSlot {
                controller: Arc::new(controller),
                generation,
                stopping: false,
            },
        );
    }

    fn on_controller_deleted(self: &Arc<Self>, name: &str, generation: u64) {
        // Dropped after the lock is released.
        let removed;
        {
            let mut registry = self.registry.lock();
            let matches = registry
                .controllers
                .get(name)
                .is_some_and(|slot| slot.generation == generation);
            if !matches {
                return;
            }
            removed = registry.controllers.remove(name);

            if let Some(sandbox) = registry.pending.remove(name) {
                if !self.shutting_down.load(Ordering::SeqCst) {
                    self.spawn_controller(&mut registry, sandbox);
                }
            }
        }
        drop(removed);
        tracing::debug!(sandbox = %name, generation, "sandbox controller removed");
        self.drained.notify_waiters();
    }
}
