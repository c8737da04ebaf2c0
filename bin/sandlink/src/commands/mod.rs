pub mod connect;
pub mod daemon;
pub mod disconnect;
pub mod sandbox;
pub mod status;

use std::net::SocketAddr;
use std::time::Duration;

use sandlink_agent::RpcClient;

use crate::cli::Cli;

/// Timeout of interactive RPC calls
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn sandbox_manager_client(cli: &Cli) -> RpcClient {
    RpcClient::new(
        SocketAddr::from(([127, 0, 0, 1], cli.sandbox_manager_port)),
        RPC_TIMEOUT,
    )
}

pub(crate) fn root_manager_client(cli: &Cli) -> RpcClient {
    RpcClient::new(
        SocketAddr::from(([127, 0, 0, 1], cli.root_manager_port)),
        RPC_TIMEOUT,
    )
}
