//! Local RPC client
//!
//! One [`RpcClient`] targets one daemon. The underlying HTTP client is built
//! lazily on first use and reused afterwards.

use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};

use super::messages::{
    ApplySandboxRequest, ApplySandboxResponse, RootStatusResponse, RpcCode, RpcErrorBody,
    ShutdownResponse, StatusResponse, APPLY_SANDBOX_PATH, RPC_SCHEMA_VERSION,
    SCHEMA_VERSION_HEADER, SHUTDOWN_PATH, STATUS_PATH,
};
use crate::error::{AgentError, Result};

/// Client for a sandlink daemon's local RPC server
#[derive(Debug)]
pub struct RpcClient {
    base_url: String,
    timeout: Duration,
    http: Mutex<Option<Client>>,
}

impl RpcClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            base_url: format!("http://{addr}"),
            timeout,
            http: Mutex::new(None),
        }
    }

    /// Same target, different timeout
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            base_url: self.base_url.clone(),
            timeout,
            http: Mutex::new(self.http.lock().clone()),
        }
    }

    fn http(&self) -> Result<Client> {
        let mut http = self.http.lock();
        if let Some(client) = http.as_ref() {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| AgentError::Internal(format!("failed to build HTTP client: {e}")))?;
        *http = Some(client.clone());
        Ok(client)
    }

    /// `ApplySandbox` on the sandbox manager
    pub async fn apply_sandbox(&self, request: &ApplySandboxRequest) -> Result<ApplySandboxResponse> {
        self.post(APPLY_SANDBOX_PATH, request).await
    }

    /// `Status` on the sandbox manager
    pub async fn status(&self) -> Result<StatusResponse> {
        self.get(STATUS_PATH).await
    }

    /// `Status` on the root manager
    pub async fn root_status(&self) -> Result<RootStatusResponse> {
        self.get(STATUS_PATH).await
    }

    /// `Shutdown` on either daemon
    pub async fn shutdown(&self) -> Result<()> {
        let _: ShutdownResponse = self.post(SHUTDOWN_PATH, &serde_json::json!({})).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.http()?.get(format!("{}{path}", self.base_url));
        self.send(request).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let request = self
            .http()?
            .post(format!("{}{path}", self.base_url))
            .json(body);
        self.send(request).await
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .header(SCHEMA_VERSION_HEADER, RPC_SCHEMA_VERSION.to_string())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    AgentError::rpc(RpcCode::Unavailable, e.to_string())
                } else {
                    AgentError::rpc(RpcCode::Unknown, e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<RpcErrorBody>(&text) {
                Ok(body) => AgentError::rpc(body.code, body.message),
                Err(_) => AgentError::rpc(RpcCode::Unknown, format!("HTTP {status}: {text}")),
            });
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::rpc(RpcCode::Internal, format!("invalid response: {e}")))
    }
}
