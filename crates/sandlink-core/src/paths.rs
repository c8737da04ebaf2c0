//! Well-known locations inside the sandlink state directory

use std::path::{Path, PathBuf};

/// Environment variable overriding the state directory
pub const STATE_DIR_ENV: &str = "SANDLINK_HOME";

/// Paths derived from the state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    /// Paths rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$SANDLINK_HOME`, else `$HOME/.sandlink`, else `/tmp/sandlink`
    pub fn default_root() -> PathBuf {
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
            return PathBuf::from(dir);
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".sandlink"),
            None => PathBuf::from("/tmp/sandlink"),
        }
    }

    /// State directory root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// PID file written by the sandbox manager
    pub fn sandbox_manager_pid_file(&self) -> PathBuf {
        self.root.join("sandbox-manager.pid")
    }

    /// PID file written by the root manager
    pub fn root_manager_pid_file(&self) -> PathBuf {
        self.root.join("root-manager.pid")
    }

    /// Daemon log directory
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// CLI config file
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }
}
