//! Launching child processes, possibly as another user
//!
//! The root manager starts the sandbox manager through a [`ProcessLauncher`].
//! How the privilege boundary is crossed is up to the launcher; the
//! supervisor only sees a [`LaunchedProcess`] handle.
//!
//! Every launched process leads its own process group, and killing it kills
//! the whole group. Whatever the launcher started on its way to the real
//! child goes down with it.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::error::{AgentError, Result};

/// Everything needed to start one child process
///
/// Built fresh for every (re)start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ChildSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// Handle to a launched process
#[async_trait]
pub trait LaunchedProcess: Send {
    /// OS process id of the launched process, while it is running
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit; returns its exit code if it had one
    async fn wait(&mut self) -> Result<Option<i32>>;

    /// Forcibly terminate the process and its process group; succeeds if
    /// they already exited
    async fn kill(&mut self) -> Result<()>;
}

/// Starts child processes
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &ChildSpec) -> Result<Box<dyn LaunchedProcess>>;
}

/// Launches the child as the current user
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectLauncher;

impl ProcessLauncher for DirectLauncher {
    fn launch(&self, spec: &ChildSpec) -> Result<Box<dyn LaunchedProcess>> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args).envs(spec.env.iter().cloned());
        spawn(command, spec.program_name())
    }
}

/// Launches the child as another user through `sudo`
///
/// `sudo` runs non-interactively and only the ChildSpec's own environment
/// variables are preserved across it.
#[derive(Debug, Clone)]
pub struct SudoLauncher {
    user: String,
    sudo: PathBuf,
}

impl SudoLauncher {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            sudo: PathBuf::from("sudo"),
        }
    }

    /// Arguments passed to `sudo` for `spec`
    pub fn sudo_args(&self, spec: &ChildSpec) -> Vec<String> {
        let mut args = vec!["-n".to_string(), "-u".to_string(), self.user.clone()];
        if !spec.env.is_empty() {
            let keys: Vec<&str> = spec.env.iter().map(|(k, _)| k.as_str()).collect();
            args.push(format!("--preserve-env={}", keys.join(",")));
        }
        args.push("--".to_string());
        args.push(spec.program_name());
        args.extend(spec.args.iter().cloned());
        args
    }
}

impl ProcessLauncher for SudoLauncher {
    fn launch(&self, spec: &ChildSpec) -> Result<Box<dyn LaunchedProcess>> {
        let mut command = Command::new(&self.sudo);
        command
            .args(self.sudo_args(spec))
            .envs(spec.env.iter().cloned());
        spawn(command, spec.program_name())
    }
}

fn spawn(mut command: Command, program: String) -> Result<Box<dyn LaunchedProcess>> {
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .process_group(0)
        .spawn()
        .map_err(|e| AgentError::launch(&program, e))?;

    tracing::debug!(program = %program, pid = ?child.id(), "launched child process");
    let group = child.id().and_then(|pid| i32::try_from(pid).ok());
    Ok(Box::new(TokioProcess { child, group }))
}

struct TokioProcess {
    child: Child,
    /// Process group led by the launched process; outlives its leader
    group: Option<i32>,
}

#[async_trait]
impl LaunchedProcess for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let pid = self.child.id().unwrap_or_default();
        let status = self.child.wait().await.map_err(|e| AgentError::Process {
            pid,
            reason: format!("wait failed: {e}"),
        })?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> Result<()> {
        if let Some(group) = self.group {
            match killpg(Pid::from_raw(group), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(group, error = %e, "failed to kill process group"),
            }
        }

        let pid = self.child.id().unwrap_or_default();
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already exited and reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(AgentError::Process {
                pid,
                reason: format!("kill failed: {e}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sudo_args_preserve_only_spec_env() {
        let spec = ChildSpec::new("/usr/local/bin/sandlink")
            .arg("sandbox-manager")
            .env("SANDLINK_CONNECT_INVOCATION_CONFIG", "abc");
        let args = SudoLauncher::new("dev").sudo_args(&spec);
        assert_eq!(
            args,
            vec![
                "-n",
                "-u",
                "dev",
                "--preserve-env=SANDLINK_CONNECT_INVOCATION_CONFIG",
                "--",
                "/usr/local/bin/sandlink",
                "sandbox-manager",
            ]
        );
    }

    #[tokio::test]
    async fn test_direct_launch_wait() {
        let spec = ChildSpec::new("sh").arg("-c").arg("exit \"$CODE\"").env("CODE", "3");
        let mut process = DirectLauncher.launch(&spec).unwrap();
        assert!(process.id().is_some());
        assert_eq!(process.wait().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_kill_running_and_exited() {
        let mut process = DirectLauncher
            .launch(&ChildSpec::new("sleep").arg("30"))
            .unwrap();
        process.kill().await.unwrap();
        assert_eq!(process.wait().await.unwrap(), None);
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_takes_down_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("inner.pid");
        let spec = ChildSpec::new("sh")
            .arg("-c")
            .arg("sh -c 'echo $$ > \"$1\"; exec sleep 30' inner \"$1\" & wait")
            .arg("sh")
            .arg(pid_file.display().to_string());
        let mut process = DirectLauncher.launch(&spec).unwrap();

        let mut inner = None;
        for _ in 0..200 {
            inner = crate::pidfile::read_pid_file(&pid_file);
            if inner.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let inner = inner.expect("inner process never started");

        process.kill().await.unwrap();
        process.wait().await.unwrap();

        // The orphaned inner process may linger as a zombie; it must not run.
        for _ in 0..200 {
            let state = std::fs::read_to_string(format!("/proc/{inner}/stat")).unwrap_or_default();
            if state.is_empty() || state.contains(") Z ") {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("inner process {inner} survived the group kill");
    }

    #[tokio::test]
    async fn test_launch_missing_program() {
        let err = match DirectLauncher.launch(&ChildSpec::new("/nonexistent/sandlink")) {
            Ok(_) => panic!("launch should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, AgentError::Launch { .. }));
    }
}
