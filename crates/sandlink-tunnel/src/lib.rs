//! Reverse tunnels for sandlink
//!
//! A reverse tunnel lets the remote cluster route traffic for one external
//! workload back to a process on this machine. This crate provides:
//!
//! - [`TunnelConfig`]: what a tunnel is keyed on
//! - [`TunnelClient`]: the setup contract, with a WebSocket control-channel
//!   implementation in [`WsTunnelClient`]
//! - [`TunnelMonitor`]: keeps exactly one tunnel alive for one workload,
//!   retrying forever until closed

pub mod client;
pub mod config;
pub mod error;
pub mod monitor;
pub mod protocol;

pub use client::{EstablishedTunnel, TunnelClient, TunnelCloser, WsTunnelClient};
pub use config::{TunnelConfig, TunnelKey};
pub use error::{Result, TunnelError};
pub use monitor::{MonitorSettings, TunnelMonitor, TunnelStatus};
pub use protocol::ControlMessage;
