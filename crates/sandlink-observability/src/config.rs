//! Configuration types for logging

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format
    Pretty,
    /// JSON format for log aggregation
    Json,
    /// Compact format (single line)
    #[default]
    Compact,
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Level for a `-v` count on top of `base`
    pub fn from_verbosity(base: LogLevel, verbose: u8) -> LogLevel {
        let order = [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ];
        let start = order.iter().position(|l| *l == base).unwrap_or(2);
        order[(start + verbose as usize).min(order.len() - 1)]
    }

    /// Filter directive for this level
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default)]
    pub level: LogLevel,

    /// Console output format
    #[serde(default)]
    pub format: LogFormat,

    /// Write console output (to stderr)
    #[serde(default = "default_true")]
    pub console: bool,

    /// Log to file (optional)
    #[serde(default)]
    pub file: Option<FileLoggingConfig>,

    /// Custom filter directives, used when `RUST_LOG` is unset
    #[serde(default)]
    pub filter_directives: Option<String>,

    /// Include source code location in logs
    #[serde(default)]
    pub include_location: bool,

    /// Include target (module path) in logs
    #[serde(default = "default_true")]
    pub include_target: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            console: true,
            file: None,
            filter_directives: None,
            include_location: false,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// Daemon logging: compact console plus a daily JSON file named after the daemon
    pub fn daemon(name: &str, log_dir: impl Into<PathBuf>, debug: bool) -> Self {
        Self {
            level: if debug { LogLevel::Debug } else { LogLevel::Info },
            file: Some(FileLoggingConfig {
                directory: log_dir.into(),
                prefix: format!("{name}.log"),
                rotation: RotationStrategy::Daily,
            }),
            ..Self::default()
        }
    }

    /// Interactive CLI logging: warnings only unless verbose
    pub fn cli(verbose: u8) -> Self {
        Self {
            level: LogLevel::from_verbosity(LogLevel::Warn, verbose),
            include_target: verbose > 1,
            ..Self::default()
        }
    }
}

/// File logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLoggingConfig {
    /// Directory for log files
    pub directory: PathBuf,

    /// File name prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Rotation strategy
    #[serde(default)]
    pub rotation: RotationStrategy,
}

fn default_prefix() -> String {
    "sandlink.log".to_string()
}

/// Log file rotation strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    /// Rotate daily
    #[default]
    Daily,
    /// Rotate hourly
    Hourly,
    /// Never rotate (single file)
    Never,
}
