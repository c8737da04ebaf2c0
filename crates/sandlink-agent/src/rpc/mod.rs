//! Local RPC between the CLI, the sandbox manager and the root manager

pub mod client;
pub mod messages;
pub mod server;

pub use client::RpcClient;
pub use messages::*;
pub use server::{
    root_manager_router, sandbox_manager_router, serve, RootManagerService, RpcError,
    SandboxManagerService,
};
