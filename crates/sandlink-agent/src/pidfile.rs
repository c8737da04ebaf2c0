//! PID files of the sandlink daemons

use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::{AgentError, Result};

/// Write the current process id to `path`, creating parent directories
pub fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AgentError::io(parent, e))?;
    }
    std::fs::write(path, format!("{}\n", std::process::id())).map_err(|e| AgentError::io(path, e))
}

/// Read a PID file; `None` if it does not exist or does not hold a PID
pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|contents| contents.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0)
}

/// Remove a PID file, ignoring a missing file
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file");
        }
    }
}

/// Whether a process with `pid` exists
///
/// A process owned by another user still counts as alive.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// The PID recorded in `path`, if that process is alive
pub fn live_pid(path: &Path) -> Option<u32> {
    read_pid_file(path).filter(|pid| is_process_alive(*pid))
}

/// Send `signal` to `pid`
pub fn send_signal(pid: u32, sig: Signal) -> Result<()> {
    let raw = i32::try_from(pid).map_err(|_| AgentError::Process {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(AgentError::Process {
            pid,
            reason: format!("failed to send {sig:?}: {e}"),
        }),
    }
}
