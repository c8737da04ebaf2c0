//! Local RPC servers
//!
//! Each daemon serves a small axum router on a loopback port. Handlers
//! delegate to a service trait so the routers can be exercised in-process.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::messages::{
    ApplySandboxRequest, ApplySandboxResponse, RootStatusResponse, RpcCode, RpcErrorBody,
    ShutdownResponse, StatusResponse, APPLY_SANDBOX_PATH, RPC_SCHEMA_VERSION,
    SCHEMA_VERSION_HEADER, SHUTDOWN_PATH, STATUS_PATH,
};

/// Error returned by an RPC handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct RpcError {
    pub code: RpcCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = self.code.http_status();
        let body = RpcErrorBody {
            code: self.code,
            message: self.message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for RpcError {
    fn from(rejection: JsonRejection) -> Self {
        RpcError::new(RpcCode::InvalidArgument, rejection.body_text())
    }
}

/// Operations served by the sandbox manager
#[async_trait]
pub trait SandboxManagerService: Send + Sync {
    async fn apply_sandbox(
        &self,
        request: ApplySandboxRequest,
    ) -> Result<ApplySandboxResponse, RpcError>;

    async fn status(&self) -> StatusResponse;

    /// Signal shutdown; idempotent, never fails
    fn shutdown(&self);
}

/// Operations served by the root manager
#[async_trait]
pub trait RootManagerService: Send + Sync {
    async fn status(&self) -> RootStatusResponse;

    /// Signal shutdown; idempotent, never fails
    fn shutdown(&self);
}

/// Router of the sandbox manager
pub fn sandbox_manager_router(service: Arc<dyn SandboxManagerService>) -> Router {
    Router::new()
        .route(APPLY_SANDBOX_PATH, post(apply_sandbox))
        .route(STATUS_PATH, get(sandbox_manager_status))
        .route(SHUTDOWN_PATH, post(sandbox_manager_shutdown))
        .layer(middleware::from_fn(check_schema_version))
        .with_state(service)
}

/// Router of the root manager
pub fn root_manager_router(service: Arc<dyn RootManagerService>) -> Router {
    Router::new()
        .route(STATUS_PATH, get(root_manager_status))
        .route(SHUTDOWN_PATH, post(root_manager_shutdown))
        .layer(middleware::from_fn(check_schema_version))
        .with_state(service)
}

/// Serve `router` until `shutdown` becomes true
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|s| *s).await;
        })
        .await
}

/// Reject requests from a peer speaking another schema version
///
/// Requests without the header are accepted, so the endpoints stay usable
/// with plain HTTP tooling.
async fn check_schema_version(request: Request, next: Next) -> Response {
    if let Some(value) = request.headers().get(SCHEMA_VERSION_HEADER) {
        let version = value.to_str().ok().and_then(|v| v.parse::<u32>().ok());
        if version != Some(RPC_SCHEMA_VERSION) {
            return RpcError::new(
                RpcCode::InvalidArgument,
                format!(
                    "unsupported RPC schema version {:?} (expected {RPC_SCHEMA_VERSION})",
                    value
                ),
            )
            .into_response();
        }
    }
    next.run(request).await
}

async fn apply_sandbox(
    State(service): State<Arc<dyn SandboxManagerService>>,
    request: Result<Json<ApplySandboxRequest>, JsonRejection>,
) -> Result<Json<ApplySandboxResponse>, RpcError> {
    let Json(request) = request?;
    if request.name.is_empty() {
        return Err(RpcError::new(
            RpcCode::InvalidArgument,
            "sandbox name is required",
        ));
    }
    service.apply_sandbox(request).await.map(Json)
}

async fn sandbox_manager_status(
    State(service): State<Arc<dyn SandboxManagerService>>,
) -> Json<StatusResponse> {
    Json(service.status().await)
}

async fn sandbox_manager_shutdown(
    State(service): State<Arc<dyn SandboxManagerService>>,
) -> (StatusCode, Json<ShutdownResponse>) {
    service.shutdown();
    (StatusCode::OK, Json(ShutdownResponse {}))
}

async fn root_manager_status(
    State(service): State<Arc<dyn RootManagerService>>,
) -> Json<RootStatusResponse> {
    Json(service.status().await)
}

async fn root_manager_shutdown(
    State(service): State<Arc<dyn RootManagerService>>,
) -> (StatusCode, Json<ShutdownResponse>) {
    service.shutdown();
    (StatusCode::OK, Json(ShutdownResponse {}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    #[derive(Default)]
    struct FakeRoot {
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl RootManagerService for FakeRoot {
        async fn status(&self) -> RootStatusResponse {
            RootStatusResponse {
                forwarding_address: Some("127.0.0.1:4000".to_string()),
                sandbox_manager_pid: Some(42),
                ..RootStatusResponse::default()
            }
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_root_status() {
        let router = root_manager_router(Arc::new(FakeRoot::default()));
        let response = router
            .oneshot(Request::get(STATUS_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let status: RootStatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.sandbox_manager_pid, Some(42));
    }

    #[tokio::test]
    async fn test_shutdown_always_succeeds() {
        let service = Arc::new(FakeRoot::default());
        let router = root_manager_router(service.clone());
        for _ in 0..3 {
            let response = router
                .clone()
                .oneshot(Request::post(SHUTDOWN_PATH).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(service.shutdowns.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_schema_version_mismatch() {
        let router = root_manager_router(Arc::new(FakeRoot::default()));
        let response = router
            .oneshot(
                Request::get(STATUS_PATH)
                    .header(SCHEMA_VERSION_HEADER, "99")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: RpcErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, RpcCode::InvalidArgument);
    }
}
