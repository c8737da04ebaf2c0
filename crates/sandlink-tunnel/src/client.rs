//! Reverse-tunnel client contract and the WebSocket control-channel client
//!
//! [`TunnelClient::setup`] registers one tunnel with the tunnel proxy and
//! returns once the proxy has acknowledged it. The returned
//! [`EstablishedTunnel`] carries a closer and a signal that fires when the
//! remote end goes away.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message as WsMessage},
};

use crate::{ControlMessage, Result, TunnelConfig, TunnelError};

/// Path of the control channel on the tunnel proxy
pub const CONTROL_PATH: &str = "/tunnel/v1";

/// Closes an established tunnel
pub trait TunnelCloser: Send {
    /// Close the underlying connection; does not wait for the remote end
    fn close(self: Box<Self>);
}

/// A tunnel that the proxy has accepted
pub struct EstablishedTunnel {
    /// Closes the tunnel from this side
    pub closer: Box<dyn TunnelCloser>,
    /// Resolves when the tunnel is closed by the remote end
    ///
    /// A dropped sender counts as closed.
    pub closed: oneshot::Receiver<()>,
}

impl EstablishedTunnel {
    #[must_use]
    pub fn new(closer: Box<dyn TunnelCloser>, closed: oneshot::Receiver<()>) -> Self {
        Self { closer, closed }
    }
}

impl std::fmt::Debug for EstablishedTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedTunnel").finish_non_exhaustive()
    }
}

/// Sets up reverse tunnels
#[async_trait]
pub trait TunnelClient: Send + Sync {
    /// Establish one tunnel
    ///
    /// # Errors
    ///
    /// Returns an error if the proxy is unreachable or refuses the
    /// registration. Callers bound this call with their own timeout.
    async fn setup(&self, config: &TunnelConfig) -> Result<EstablishedTunnel>;
}

/// [`TunnelClient`] speaking JSON over a WebSocket control channel
///
/// The proxy address is read from a watch channel on every setup, so tunnels
/// built after a port-forward restart follow the new local port.
#[derive(Debug, Clone)]
pub struct WsTunnelClient {
    address: watch::Receiver<Option<String>>,
}

impl WsTunnelClient {
    #[must_use]
    pub fn new(address: watch::Receiver<Option<String>>) -> Self {
        Self { address }
    }

    /// Client for a proxy at a fixed `host:port`
    #[must_use]
    pub fn fixed(address: impl Into<String>) -> Self {
        let (_tx, rx) = watch::channel(Some(address.into()));
        Self { address: rx }
    }
}

#[async_trait]
impl TunnelClient for WsTunnelClient {
    async fn setup(&self, config: &TunnelConfig) -> Result<EstablishedTunnel> {
        let address = self
            .address
            .borrow()
            .clone()
            .ok_or_else(|| TunnelError::setup("no forwarding address available"))?;
        let url = format!("ws://{address}{CONTROL_PATH}");
        let key = config.key();

        tracing::debug!(url = %url, tunnel = %key, "connecting to tunnel proxy");
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(TunnelError::connection)?;
        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let register = ControlMessage::Register {
            routing_key: config.routing_key.clone(),
            workload: config.workload.clone(),
            user: config.user.clone(),
            mappings: config.mappings.clone(),
        };
        ws_sink
            .send(WsMessage::Text(register.encode()?.into()))
            .await
            .map_err(TunnelError::connection)?;

        let tunnel_id = loop {
            match ws_stream.next().await {
                Some(Ok(WsMessage::Text(text))) => match ControlMessage::decode(&text)? {
                    ControlMessage::Registered { tunnel_id } => break tunnel_id,
                    ControlMessage::Rejected { reason } => {
                        return Err(TunnelError::rejected(reason));
                    }
                    ControlMessage::Heartbeat { .. } => {}
                    other => {
                        return Err(TunnelError::protocol(format!(
                            "expected registered, got {other:?}"
                        )));
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(TunnelError::connection_msg(
                        "connection closed before registration",
                    ));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TunnelError::connection(e)),
            }
        };

        tracing::debug!(tunnel = %key, tunnel_id = %tunnel_id, "tunnel registered");

        let (close_tx, close_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(run_control_channel(
            key.to_string(),
            ws_sink,
            ws_stream,
            close_rx,
            closed_tx,
        ));

        Ok(EstablishedTunnel::new(
            Box::new(WsCloser { tx: close_tx }),
            closed_rx,
        ))
    }
}

struct WsCloser {
    tx: oneshot::Sender<()>,
}

impl TunnelCloser for WsCloser {
    fn close(self: Box<Self>) {
        let _ = self.tx.send(());
    }
}

/// Keeps the control channel alive until either side closes it
async fn run_control_channel<Si, St>(
    tunnel: String,
    mut ws_sink: Si,
    mut ws_stream: St,
    mut close_rx: oneshot::Receiver<()>,
    closed_tx: oneshot::Sender<()>,
) where
    Si: Sink<WsMessage> + Unpin + Send,
    St: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin + Send,
{
    loop {
        tokio::select! {
            // A dropped closer also lands here.
            _ = &mut close_rx => {
                let _ = ws_sink.send(WsMessage::Close(None)).await;
                let _ = ws_sink.close().await;
                tracing::debug!(tunnel = %tunnel, "control channel closed locally");
                return;
            }
            msg = ws_stream.next() => match msg {
                Some(Ok(WsMessage::Ping(data))) => {
                    if ws_sink.send(WsMessage::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Text(text))) => match ControlMessage::decode(&text) {
                    Ok(heartbeat @ ControlMessage::Heartbeat { .. }) => {
                        let Ok(encoded) = heartbeat.encode() else {
                            break;
                        };
                        if ws_sink.send(WsMessage::Text(encoded.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(other) => {
                        tracing::debug!(tunnel = %tunnel, message = ?other, "ignoring control message");
                    }
                    Err(e) => {
                        tracing::warn!(tunnel = %tunnel, error = %e, "bad control message");
                        break;
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(tunnel = %tunnel, error = %e, "control channel error");
                    break;
                }
            }
        }
    }

    tracing::debug!(tunnel = %tunnel, "control channel closed by remote");
    let _ = closed_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn config() -> TunnelConfig {
        TunnelConfig {
            routing_key: "rk1".to_string(),
            workload: "frontend".to_string(),
            user: "m-abc".to_string(),
            mappings: vec![],
        }
    }

    /// Accepts one control channel, answers the registration with `reply`,
    /// then either hangs up or waits for the client to close.
    async fn fake_proxy(
        reply: ControlMessage,
        hang_up: bool,
    ) -> (String, oneshot::Receiver<ControlMessage>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            let text = first.into_text().unwrap();
            let register = ControlMessage::decode(&text).unwrap();

            ws.send(WsMessage::Text(reply.encode().unwrap().into()))
                .await
                .unwrap();

            if hang_up {
                let _ = ws.close(None).await;
            } else {
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                }
            }
            let _ = done_tx.send(register);
        });

        (addr, done_rx)
    }

    #[tokio::test]
    async fn test_setup_then_remote_close() {
        let (addr, registered) = fake_proxy(
            ControlMessage::Registered {
                tunnel_id: "t-1".to_string(),
            },
            true,
        )
        .await;

        let client = WsTunnelClient::fixed(addr);
        let tunnel = client.setup(&config()).await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(2), tunnel.closed).await;
        assert!(closed.is_ok());

        let register = registered.await.unwrap();
        assert!(matches!(
            register,
            ControlMessage::Register { ref workload, .. } if workload == "frontend"
        ));
    }

    #[tokio::test]
    async fn test_local_close_reaches_proxy() {
        let (addr, done) = fake_proxy(
            ControlMessage::Registered {
                tunnel_id: "t-2".to_string(),
            },
            false,
        )
        .await;

        let client = WsTunnelClient::fixed(addr);
        let tunnel = client.setup(&config()).await.unwrap();
        tunnel.closer.close();

        let result = tokio::time::timeout(Duration::from_secs(2), done).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_registration() {
        let (addr, _done) = fake_proxy(
            ControlMessage::Rejected {
                reason: "unknown routing key".to_string(),
            },
            true,
        )
        .await;

        let client = WsTunnelClient::fixed(addr);
        let err = client.setup(&config()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_no_forwarding_address() {
        let (_tx, rx) = watch::channel(None);
        let client = WsTunnelClient::new(rx);
        let err = client.setup(&config()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Setup { .. }));
    }
}
