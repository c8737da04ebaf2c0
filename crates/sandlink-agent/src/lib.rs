//! sandlink local control plane
//!
//! The sandbox manager keeps reverse tunnels for every sandbox that
//! references this machine; the root manager supervises it from the
//! privileged side and owns the OS overlays. Both speak a small JSON RPC
//! over loopback.

pub mod controller;
pub mod error;
pub mod launcher;
pub mod overlay;
pub mod pidfile;
pub mod port_forward;
pub mod root_manager;
pub mod rpc;
pub mod sandbox_manager;
pub mod supervisor;
pub mod watcher;

pub use controller::{ControllerSettings, DeletionCallback, SandboxController};
pub use error::*;
pub use launcher::{ChildSpec, DirectLauncher, LaunchedProcess, ProcessLauncher, SudoLauncher};
pub use overlay::{
    CommandOverlayFactory, NoopOverlayFactory, OverlayFactory, OverlayKind, OverlayService,
};
pub use port_forward::{PortForward, PortForwardSettings, PortForwardTarget};
pub use root_manager::{
    run_root_manager, OverlayManager, RootManager, RootManagerSettings, SANDBOX_MANAGER_SUBCOMMAND,
};
pub use rpc::{RpcClient, RpcCode};
pub use sandbox_manager::{run_sandbox_manager, SandboxManager, SandboxManagerSettings};
pub use supervisor::{Supervisor, SupervisorSettings};
pub use watcher::{SandboxWatcher, WatcherSettings};
