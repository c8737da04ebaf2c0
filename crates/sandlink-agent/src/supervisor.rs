//! Process supervisor for the sandbox manager
//!
//! The root manager launches the sandbox manager through a
//! [`ProcessLauncher`], finds the real child by the PID file it writes, and
//! restarts it whenever it dies. Stopping asks the child to shut down over
//! RPC, waits for a grace period, then kills it. [`Supervisor::stop`] only
//! returns once the child is gone.
//!
//! The launcher may sit between the supervisor and the child (`sudo`), so
//! killing the launched process alone is not enough. The launcher's process
//! group is killed with it, and a child found in the PID file that is no
//! longer tracked is killed before the next launch and on exit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::Result;
use crate::launcher::{ChildSpec, LaunchedProcess, ProcessLauncher};
use crate::pidfile::{is_process_alive, read_pid_file, remove_pid_file, send_signal};
use crate::rpc::RpcClient;

/// Builds the child specification for each (re)start
pub type SpecBuilder = Arc<dyn Fn() -> Result<ChildSpec> + Send + Sync>;

/// Timing of a [`Supervisor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// How long a stopping child gets to exit on its own
    pub graceful_timeout: Duration,
    /// How long a new child gets to write its PID file
    pub pid_file_timeout: Duration,
    /// Delay before restarting a dead child
    pub restart_delay: Duration,
    /// Liveness poll period
    pub poll_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(5),
            pid_file_timeout: Duration::from_secs(10),
            restart_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
        }
    }
}

struct SupervisorInner {
    launcher: Arc<dyn ProcessLauncher>,
    build_spec: SpecBuilder,
    pid_file: PathBuf,
    rpc: RpcClient,
    settings: SupervisorSettings,
    child_pid: Mutex<Option<u32>>,
    launches: AtomicU32,
}

enum Located {
    Pid(u32),
    Exited(Option<i32>),
    TimedOut,
    Stop,
}

/// Keeps the sandbox manager running
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Supervisor {
    /// Launch the child and start supervising it
    ///
    /// `rpc` targets the child's RPC server and is used for graceful
    /// shutdown.
    pub fn start(
        launcher: Arc<dyn ProcessLauncher>,
        build_spec: SpecBuilder,
        pid_file: PathBuf,
        rpc: RpcClient,
        settings: SupervisorSettings,
    ) -> Self {
        let inner = Arc::new(SupervisorInner {
            launcher,
            build_spec,
            pid_file,
            rpc,
            settings,
            child_pid: Mutex::new(None),
            launches: AtomicU32::new(0),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let task = Arc::clone(&inner);
        tokio::spawn(async move {
            task.run(stop_rx).await;
            done_tx.send_replace(true);
        });

        Self {
            inner,
            stop_tx,
            done_rx,
        }
    }

    /// PID of the running child, once it has written its PID file
    pub fn child_pid(&self) -> Option<u32> {
        *self.inner.child_pid.lock()
    }

    /// Number of times the child has been launched
    pub fn launches(&self) -> u32 {
        self.inner.launches.load(Ordering::SeqCst)
    }

    /// Stop the child and wait until it is no longer running
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|d| *d).await;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

impl SupervisorInner {
    async fn run(&self, mut stop_rx: watch::Receiver<bool>) {
        while !*stop_rx.borrow() {
            let spec = match (self.build_spec)() {
                Ok(spec) => spec,
                Err(e) => {
                    tracing::error!(error = %e, "cannot build sandbox manager command");
                    if self.sleep_or_stop(&mut stop_rx).await {
                        break;
                    }
                    continue;
                }
            };

            // At most one child: a stale file must not be mistaken for the new one.
            self.kill_untracked().await;
            remove_pid_file(&self.pid_file);
            let mut process = match self.launcher.launch(&spec) {
                Ok(process) => process,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to launch sandbox manager");
                    if self.sleep_or_stop(&mut stop_rx).await {
                        break;
                    }
                    continue;
                }
            };
            let launches = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(launcher_pid = ?process.id(), launches, "sandbox manager launched");

            let pid = match self.locate(&mut process, &mut stop_rx).await {
                Located::Pid(pid) => pid,
                Located::Stop => {
                    self.terminate(&mut process, None).await;
                    self.kill_untracked().await;
                    break;
                }
                Located::Exited(code) => {
                    tracing::warn!(code = ?code, "sandbox manager exited before writing its PID file");
                    if self.sleep_or_stop(&mut stop_rx).await {
                        break;
                    }
                    continue;
                }
                Located::TimedOut => {
                    tracing::warn!(
                        timeout = ?self.settings.pid_file_timeout,
                        "sandbox manager did not write its PID file, restarting"
                    );
                    self.kill(&mut process, None).await;
                    self.kill_untracked().await;
                    continue;
                }
            };
            *self.child_pid.lock() = Some(pid);
            tracing::info!(pid, "sandbox manager running");

            let stopped = tokio::select! {
                _ = stop_rx.wait_for(|s| *s) => true,
                code = process.wait() => {
                    tracing::warn!(pid, code = ?code.ok().flatten(), "sandbox manager exited");
                    false
                }
                _ = self.wait_pid_gone(pid) => {
                    tracing::warn!(pid, "sandbox manager process disappeared");
                    false
                }
            };

            if stopped {
                self.terminate(&mut process, Some(pid)).await;
                *self.child_pid.lock() = None;
                break;
            }

            *self.child_pid.lock() = None;
            // Reap whatever is left of the launcher process.
            self.kill(&mut process, None).await;
            if self.sleep_or_stop(&mut stop_rx).await {
                break;
            }
        }
        self.kill_untracked().await;
        remove_pid_file(&self.pid_file);
    }

    /// Wait for the new child's PID file
    async fn locate(
        &self,
        process: &mut Box<dyn LaunchedProcess>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Located {
        let deadline = tokio::time::Instant::now() + self.settings.pid_file_timeout;
        let poll = self.settings.poll_interval.min(Duration::from_millis(100));
        loop {
            if let Some(pid) = read_pid_file(&self.pid_file) {
                if is_process_alive(pid) {
                    return Located::Pid(pid);
                }
            }
            tokio::select! {
                _ = stop_rx.wait_for(|s| *s) => return Located::Stop,
                code = process.wait() => return Located::Exited(code.ok().flatten()),
                _ = tokio::time::sleep_until(deadline) => return Located::TimedOut,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    async fn wait_pid_gone(&self, pid: u32) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !is_process_alive(pid) {
                return;
            }
        }
    }

    /// Kill a child recorded in the PID file that nothing tracks any more
    async fn kill_untracked(&self) {
        let Some(pid) = read_pid_file(&self.pid_file) else {
            return;
        };
        if !is_process_alive(pid) {
            return;
        }
        tracing::warn!(pid, "killing untracked sandbox manager");
        if let Err(e) = send_signal(pid, Signal::SIGKILL) {
            tracing::warn!(pid, error = %e, "failed to kill untracked sandbox manager");
            return;
        }
        if tokio::time::timeout(self.settings.graceful_timeout, self.wait_pid_gone(pid))
            .await
            .is_err()
        {
            tracing::warn!(pid, "untracked sandbox manager still present after SIGKILL");
        }
    }

    /// Graceful shutdown over RPC, then force
    ///
    /// The RPC and the wait for exit share one grace period.
    async fn terminate(&self, process: &mut Box<dyn LaunchedProcess>, pid: Option<u32>) {
        let graceful = tokio::time::timeout(self.settings.graceful_timeout, async {
            if let Err(e) = self.rpc.shutdown().await {
                tracing::debug!(error = %e, "graceful shutdown request failed");
            }
            let _ = process.wait().await;
            if let Some(pid) = pid {
                self.wait_pid_gone(pid).await;
            }
        })
        .await;

        match graceful {
            Ok(()) => tracing::info!(pid = ?pid, "sandbox manager stopped"),
            Err(_) => {
                tracing::warn!(
                    pid = ?pid,
                    timeout = ?self.settings.graceful_timeout,
                    "sandbox manager did not stop in time, killing"
                );
                self.kill(process, pid).await;
            }
        }
    }

    /// Kill the child and block until it has exited
    async fn kill(&self, process: &mut Box<dyn LaunchedProcess>, pid: Option<u32>) {
        if let Some(pid) = pid {
            if let Err(e) = send_signal(pid, Signal::SIGKILL) {
                tracing::warn!(pid, error = %e, "failed to kill sandbox manager");
            }
        }
        if let Err(e) = process.kill().await {
            tracing::warn!(error = %e, "failed to kill launched process");
        }
        let _ = process.wait().await;
        if let Some(pid) = pid {
            self.wait_pid_gone(pid).await;
        }
    }

    async fn sleep_or_stop(&self, stop_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = stop_rx.wait_for(|s| *s) => true,
            _ = tokio::time::sleep(self.settings.restart_delay) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::DirectLauncher;
    use std::net::SocketAddr;

    fn unused_rpc() -> RpcClient {
        // Nothing listens on port 1 of loopback.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        RpcClient::new(addr, Duration::from_millis(200))
    }

    fn fast() -> SupervisorSettings {
        SupervisorSettings {
            graceful_timeout: Duration::from_millis(200),
            pid_file_timeout: Duration::from_secs(5),
            restart_delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn script_spec(script: &'static str, pid_file: PathBuf) -> SpecBuilder {
        Arc::new(move || {
            Ok(ChildSpec::new("sh")
                .arg("-c")
                .arg(script)
                .arg("sh")
                .arg(pid_file.display().to_string()))
        })
    }

    async fn wait_for_pid(supervisor: &Supervisor) -> u32 {
        for _ in 0..500 {
            if let Some(pid) = supervisor.child_pid() {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("child never wrote its PID file");
    }

    #[tokio::test]
    async fn test_stop_kills_unresponsive_child() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sandbox-manager.pid");
        let supervisor = Supervisor::start(
            Arc::new(DirectLauncher),
            script_spec("echo $$ > \"$1\"; trap '' TERM; exec sleep 30", pid_file.clone()),
            pid_file.clone(),
            unused_rpc(),
            fast(),
        );

        let pid = wait_for_pid(&supervisor).await;
        assert!(is_process_alive(pid));

        tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .unwrap();
        assert!(!is_process_alive(pid));
        assert_eq!(supervisor.child_pid(), None);
        assert!(!pid_file.exists());

        // Idempotent.
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_dead_child_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sandbox-manager.pid");
        let supervisor = Supervisor::start(
            Arc::new(DirectLauncher),
            script_spec("echo $$ > \"$1\"; sleep 0.1", pid_file.clone()),
            pid_file.clone(),
            unused_rpc(),
            fast(),
        );

        for _ in 0..500 {
            if supervisor.launches() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(supervisor.launches() >= 3);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_before_wrapped_child_writes_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sandbox-manager.pid");
        // The outer shell stands in for sudo: the real child is its child.
        let supervisor = Supervisor::start(
            Arc::new(DirectLauncher),
            script_spec(
                "sh -c 'sleep 0.3; echo $$ > \"$1\"; exec sleep 30' child \"$1\" & wait",
                pid_file.clone(),
            ),
            pid_file.clone(),
            unused_rpc(),
            fast(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .unwrap();

        // Past the point where a surviving child would have written its PID.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let survivor = read_pid_file(&pid_file).filter(|pid| is_process_alive(*pid));
        assert_eq!(survivor, None, "sandbox manager outlived Supervisor::stop");
    }

    #[tokio::test]
    async fn test_stale_child_killed_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sandbox-manager.pid");
        let mut stale = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let stale_pid = stale.id().unwrap();
        std::fs::write(&pid_file, stale_pid.to_string()).unwrap();

        let supervisor = Supervisor::start(
            Arc::new(DirectLauncher),
            script_spec("echo $$ > \"$1\"; exec sleep 30", pid_file.clone()),
            pid_file.clone(),
            unused_rpc(),
            fast(),
        );

        let status = tokio::time::timeout(Duration::from_secs(5), stale.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        let pid = wait_for_pid(&supervisor).await;
        assert_ne!(pid, stale_pid);

        supervisor.stop().await;
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_unresponsive_rpc_counts_against_grace_period() {
        // Accepts connections but never answers.
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let rpc = RpcClient::new(silent.local_addr().unwrap(), Duration::from_secs(10));

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sandbox-manager.pid");
        let supervisor = Supervisor::start(
            Arc::new(DirectLauncher),
            script_spec("echo $$ > \"$1\"; trap '' TERM; exec sleep 30", pid_file.clone()),
            pid_file.clone(),
            rpc,
            SupervisorSettings {
                graceful_timeout: Duration::from_millis(300),
                ..fast()
            },
        );
        let pid = wait_for_pid(&supervisor).await;

        let started = tokio::time::Instant::now();
        supervisor.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_stop_before_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sandbox-manager.pid");
        let supervisor = Supervisor::start(
            Arc::new(DirectLauncher),
            script_spec("exec sleep 30", pid_file.clone()),
            pid_file,
            unused_rpc(),
            fast(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .unwrap();
        assert_eq!(supervisor.launches(), 1);
    }
}
