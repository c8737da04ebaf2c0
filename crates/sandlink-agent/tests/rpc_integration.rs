//! Sandbox manager RPC against a fake remote API

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use futures_util::StreamExt;
use sandlink_agent::rpc::{
    sandbox_manager_router, serve, ApplySandboxRequest, RpcErrorBody, APPLY_SANDBOX_PATH,
    STATUS_PATH,
};
use sandlink_agent::{RpcClient, RpcCode, SandboxManager, SandboxWatcher, WatcherSettings};
use sandlink_api::{AppliedSandbox, ApiError, SandboxApi, SandboxStream, WatchError, WatchStream};
use sandlink_core::{
    ConnectInvocationConfig, ConnectionConfig, DowngradeUser, OverlayCommands, Sandbox,
    INVOCATION_SCHEMA_VERSION,
};
use sandlink_tunnel::{EstablishedTunnel, TunnelClient, TunnelConfig, TunnelError};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceExt;

/// Remote API that knows exactly one sandbox
#[derive(Default)]
struct FakeApi {
    applies: AtomicUsize,
}

#[async_trait]
impl SandboxApi for FakeApi {
    async fn apply_sandbox(
        &self,
        name: &str,
        spec: &serde_json::Value,
    ) -> sandlink_api::Result<AppliedSandbox> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        match name {
            "known" => {
                let raw = json!({
                    "name": name,
                    "routingKey": "rk-known",
                    "spec": spec,
                });
                Ok(AppliedSandbox {
                    sandbox: Sandbox {
                        routing_key: "rk-known".to_string(),
                        ..Sandbox::empty(name)
                    },
                    raw,
                })
            }
            "forbidden" => Err(ApiError::Status {
                status: 403,
                message: "not allowed".to_string(),
            }),
            "broken" => Err(ApiError::Status {
                status: 500,
                message: "database down".to_string(),
            }),
            _ => Err(ApiError::Status {
                status: 404,
                message: format!("sandbox {name} not found"),
            }),
        }
    }

    async fn watch_local_sandboxes(
        &self,
        _machine_id: &str,
    ) -> Result<WatchStream, WatchError> {
        Ok(futures_util::stream::pending().boxed())
    }

    async fn watch_sandbox(&self, _name: &str) -> Result<SandboxStream, WatchError> {
        Ok(futures_util::stream::pending().boxed())
    }
}

struct DownTunnels;

#[async_trait]
impl TunnelClient for DownTunnels {
    async fn setup(&self, _config: &TunnelConfig) -> Result<EstablishedTunnel, TunnelError> {
        Err(TunnelError::setup("proxy unavailable"))
    }
}

fn config() -> ConnectInvocationConfig {
    ConnectInvocationConfig {
        schema_version: INVOCATION_SCHEMA_VERSION,
        api_url: "https://api.example.com".to_string(),
        api_key: "secret-key".to_string(),
        org: "acme".to_string(),
        cluster: "staging".to_string(),
        connection: ConnectionConfig::ProxyAddress {
            address: "127.0.0.1:1080".to_string(),
        },
        with_root_manager: false,
        sandbox_manager_port: 6666,
        root_manager_port: 6667,
        user: DowngradeUser {
            name: "dev".to_string(),
            uid: 1000,
            gid: 1000,
            home: "/home/dev".into(),
        },
        state_dir: "/tmp/sandlink-rpc-test".into(),
        debug: false,
        overlay: OverlayCommands::default(),
    }
}

fn manager(api: Arc<FakeApi>) -> (Arc<SandboxManager>, SandboxWatcher, watch::Receiver<bool>) {
    let watcher = SandboxWatcher::new(
        api.clone(),
        Arc::new(DownTunnels),
        "machine-1",
        WatcherSettings::default(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (_fwd_tx, forwarding) = watch::channel(Some("127.0.0.1:1080".to_string()));
    let manager = SandboxManager::new(config(), api, watcher.clone(), forwarding, shutdown_tx);
    (Arc::new(manager), watcher, shutdown_rx)
}

fn apply_request(name: &str) -> Request<Body> {
    let body = json!({ "name": name, "spec": { "cluster": "staging" } });
    Request::post(APPLY_SANDBOX_PATH)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn error_body(response: axum::response::Response) -> RpcErrorBody {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_apply_not_found_is_classified() {
    let api = Arc::new(FakeApi::default());
    let (manager, watcher, _rx) = manager(api.clone());
    let router = sandbox_manager_router(manager);

    let response = router.oneshot(apply_request("missing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error = error_body(response).await;
    assert_eq!(error.code, RpcCode::NotFound);
    assert!(error.message.contains("missing"));

    assert_eq!(api.applies.load(Ordering::SeqCst), 1);
    assert!(watcher.sandbox_names().is_empty());
}

#[tokio::test]
async fn test_apply_error_codes() {
    let api = Arc::new(FakeApi::default());
    let (manager, _watcher, _rx) = manager(api);
    let router = sandbox_manager_router(manager);

    let cases = [
        ("forbidden", StatusCode::BAD_REQUEST, RpcCode::InvalidArgument),
        ("broken", StatusCode::INTERNAL_SERVER_ERROR, RpcCode::Internal),
    ];
    for (name, status, code) in cases {
        let response = router.clone().oneshot(apply_request(name)).await.unwrap();
        assert_eq!(response.status(), status);
        assert_eq!(error_body(response).await.code, code);
    }
}

#[tokio::test]
async fn test_apply_registers_sandbox() {
    let api = Arc::new(FakeApi::default());
    let (manager, watcher, _rx) = manager(api);
    let router = sandbox_manager_router(manager);

    let response = router.clone().oneshot(apply_request("known")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let applied: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(applied["sandbox"]["routingKey"], "rk-known");
    assert_eq!(watcher.sandbox_names(), vec!["known"]);

    let response = router
        .oneshot(Request::get(STATUS_PATH).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["sandboxes"][0]["name"], "known");
    assert_eq!(status["connectionConfig"]["apiKey"], "<redacted>");

    watcher.shutdown().await;
}

#[tokio::test]
async fn test_malformed_request_is_invalid_argument() {
    let api = Arc::new(FakeApi::default());
    let (manager, _watcher, _rx) = manager(api.clone());
    let router = sandbox_manager_router(manager);

    let request = Request::post(APPLY_SANDBOX_PATH)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"spec\": 1"))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_body(response).await.code, RpcCode::InvalidArgument);
    assert_eq!(api.applies.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_client_over_loopback() {
    let api = Arc::new(FakeApi::default());
    let (manager, _watcher, shutdown_rx) = manager(api);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve(
        listener,
        sandbox_manager_router(manager),
        shutdown_rx.clone(),
    ));

    let client = RpcClient::new(addr, Duration::from_secs(5));
    let err = client
        .apply_sandbox(&ApplySandboxRequest {
            name: "missing".to_string(),
            spec: json!({}),
        })
        .await
        .unwrap_err();
    assert_eq!(err.rpc_code(), Some(RpcCode::NotFound));

    let status = client.status().await.unwrap();
    assert_eq!(status.connection_config.cluster, "staging");
    assert!(!status.root_manager_reachable);

    // Shutdown ends the server.
    client.shutdown().await.unwrap();
    client.shutdown().await.ok();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(*shutdown_rx.borrow());
}
