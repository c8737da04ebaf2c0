//! Remote API contract and its HTTP implementation

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, Response, Url};
use sandlink_core::Sandbox;

use crate::watch::{SandboxEvent, SandboxStream, WatchCode, WatchError, WatchEvent, WatchStream};
use crate::{ApiError, Result};

/// Result of a successful apply
#[derive(Debug, Clone)]
pub struct AppliedSandbox {
    /// Response body as returned by the API
    pub raw: serde_json::Value,
    /// The parsed sandbox
    pub sandbox: Sandbox,
}

/// Operations the sandbox manager needs from the remote control plane
#[async_trait]
pub trait SandboxApi: Send + Sync {
    /// Create or update a sandbox
    ///
    /// # Errors
    ///
    /// [`ApiError::Status`] carries the HTTP status of a rejected request so
    /// callers can classify it.
    async fn apply_sandbox(&self, name: &str, spec: &serde_json::Value)
        -> Result<AppliedSandbox>;

    /// Open the stream of sandboxes that reference `machine_id`
    async fn watch_local_sandboxes(
        &self,
        machine_id: &str,
    ) -> std::result::Result<WatchStream, WatchError>;

    /// Follow one sandbox
    ///
    /// The stream yields the sandbox whenever it changes, including workload
    /// status. A `NotFound` error means the sandbox was deleted.
    async fn watch_sandbox(&self, name: &str) -> std::result::Result<SandboxStream, WatchError>;
}

/// [`SandboxApi`] over HTTP
#[derive(Clone)]
pub struct HttpSandboxApi {
    client: Client,
    base_url: Url,
    org: String,
    api_key: String,
    request_timeout: Duration,
}

impl HttpSandboxApi {
    /// Create a client for `base_url`
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an HTTP base URL or the HTTP
    /// client cannot be built.
    pub fn new(
        base_url: impl AsRef<str>,
        org: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())
            .map_err(|e| ApiError::Transport(format!("invalid API URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Transport(format!("invalid API URL: {base_url}")));
        }

        // No overall timeout: the watch request is long-lived.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            org: org.into(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(30),
        })
    }

    /// Timeout for request/response calls
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// `{base}/api/v2/orgs/{org}/{segments..}`, each segment percent-encoded
    fn org_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`: the base URL can take path segments.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["api", "v2", "orgs", self.org.as_str()])
                .extend(segments);
        }
        url
    }

    async fn open_stream(&self, url: Url) -> std::result::Result<Response, WatchError> {
        tracing::debug!(url = %url, "opening watch");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/x-ndjson")
            .send()
            .await
            .map_err(|e| WatchError::new(WatchCode::Unavailable, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(WatchError::new(
                WatchCode::from_http_status(status.as_u16()),
                message,
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl SandboxApi for HttpSandboxApi {
    async fn apply_sandbox(
        &self,
        name: &str,
        spec: &serde_json::Value,
    ) -> Result<AppliedSandbox> {
        let url = self.org_url(&["sandboxes", name]);
        tracing::debug!(url = %url, "applying sandbox");

        let response = self
            .client
            .put(url)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(spec)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let raw: serde_json::Value = response.json().await?;
        let sandbox: Sandbox =
            serde_json::from_value(raw.clone()).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(AppliedSandbox { raw, sandbox })
    }

    async fn watch_local_sandboxes(
        &self,
        machine_id: &str,
    ) -> std::result::Result<WatchStream, WatchError> {
        let mut url = self.org_url(&["local", "sandboxes", "watch"]);
        url.query_pairs_mut().append_pair("machineID", machine_id);
        let response = self.open_stream(url).await?;
        Ok(ndjson_events(response.bytes_stream(), WatchEvent::decode))
    }

    async fn watch_sandbox(&self, name: &str) -> std::result::Result<SandboxStream, WatchError> {
        let url = self.org_url(&["sandboxes", name, "watch"]);
        let response = self.open_stream(url).await?;
        Ok(ndjson_events(response.bytes_stream(), SandboxEvent::decode))
    }
}

struct LineReader<S> {
    body: Pin<Box<S>>,
    buf: Vec<u8>,
    eof: bool,
    done: bool,
}

/// Split a chunked body into NDJSON events decoded with `decode`
///
/// The stream ends after its first error. A body that simply ends yields a
/// final `Unavailable` error so the consumer reconnects.
fn ndjson_events<S, B, E, T>(
    body: S,
    decode: fn(&[u8]) -> std::result::Result<T, WatchError>,
) -> BoxStream<'static, std::result::Result<T, WatchError>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
    T: Send + 'static,
{
    let reader = LineReader {
        body: Box::pin(body),
        buf: Vec::new(),
        eof: false,
        done: false,
    };

    futures_util::stream::unfold(reader, move |mut reader| async move {
        loop {
            if reader.done {
                return None;
            }

            let line = match reader.buf.iter().position(|b| *b == b'\n') {
                Some(pos) => Some(reader.buf.drain(..=pos).collect::<Vec<u8>>()),
                None if reader.eof && !reader.buf.trim_ascii().is_empty() => {
                    Some(std::mem::take(&mut reader.buf))
                }
                None => None,
            };

            if let Some(line) = line {
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                let event = decode(line);
                reader.done = event.is_err();
                return Some((event, reader));
            }

            if reader.eof {
                reader.done = true;
                return Some((
                    Err(WatchError::new(WatchCode::Unavailable, "watch stream ended")),
                    reader,
                ));
            }

            match reader.body.next().await {
                Some(Ok(chunk)) => reader.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    reader.done = true;
                    return Some((
                        Err(WatchError::new(
                            WatchCode::Unavailable,
                            format!("watch stream broken: {e}"),
                        )),
                        reader,
                    ));
                }
                None => reader.eof = true,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query},
        http::StatusCode,
        routing::{get, put},
        Json, Router,
    };

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fake_api() -> Router {
        Router::new()
            .route(
                "/api/v2/orgs/acme/sandboxes/{name}",
                put(
                    |Path(name): Path<String>, Json(body): Json<serde_json::Value>| async move {
                        if name == "missing" {
                            return Err((StatusCode::NOT_FOUND, "cluster not found"));
                        }
                        if name.contains('/') {
                            return Err((StatusCode::BAD_REQUEST, "slash in sandbox name"));
                        }
                        let mut body = body;
                        body["name"] = serde_json::Value::String(name);
                        body["routingKey"] = serde_json::Value::String("rk-new".to_string());
                        Ok(Json(body))
                    },
                ),
            )
            .route(
                "/api/v2/orgs/acme/local/sandboxes/watch",
                get(
                    |Query(query): Query<std::collections::HashMap<String, String>>| async move {
                        if query.get("machineID").map(String::as_str) != Some("m-abc") {
                            return Err(StatusCode::BAD_REQUEST);
                        }
                        Ok(concat!(
                            r#"{"sandboxes":[{"name":"sb1","routingKey":"rk1"}]}"#,
                            "\n\n",
                            r#"{"sandboxes":[]}"#,
                            "\n",
                        ))
                    },
                ),
            )
            .route(
                "/api/v2/orgs/acme/sandboxes/{name}/watch",
                get(|Path(name): Path<String>| async move {
                    if name == "gone" {
                        return Err((StatusCode::NOT_FOUND, "sandbox deleted"));
                    }
                    Ok(format!(
                        concat!(
                            r#"{{"sandbox":{{"name":"{name}","routingKey":"rk1","externalWorkloads":[]}}}}"#,
                            "\n",
                            r#"{{"error":{{"code":"not_found","message":"deleted"}}}}"#,
                            "\n",
                        ),
                        name = name
                    ))
                }),
            )
            .route(
                "/api/v2/orgs/denied/local/sandboxes/watch",
                get(|| async { (StatusCode::FORBIDDEN, "revoked") }),
            )
    }

    #[tokio::test]
    async fn test_apply_sandbox() {
        let base = serve(fake_api()).await;
        let api = HttpSandboxApi::new(&base, "acme", "key").unwrap();

        let applied = api
            .apply_sandbox("feature-x", &serde_json::json!({"spec": {}}))
            .await
            .unwrap();
        assert_eq!(applied.sandbox.name, "feature-x");
        assert_eq!(applied.sandbox.routing_key, "rk-new");
        assert!(applied.raw.get("spec").is_some());
    }

    #[tokio::test]
    async fn test_apply_sandbox_status_error() {
        let base = serve(fake_api()).await;
        let api = HttpSandboxApi::new(&base, "acme", "key").unwrap();

        let err = api
            .apply_sandbox("missing", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_watch_stream_events_then_end() {
        let base = serve(fake_api()).await;
        let api = HttpSandboxApi::new(&base, "acme", "key").unwrap();

        let mut stream = api.watch_local_sandboxes("m-abc").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "sb1");

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.is_empty());

        let ended = stream.next().await.unwrap().unwrap_err();
        assert_eq!(ended.code, WatchCode::Unavailable);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_path_and_query_are_encoded() {
        let base = serve(fake_api()).await;
        let api = HttpSandboxApi::new(&base, "acme", "key").unwrap();

        let applied = api
            .apply_sandbox("feature x/1", &serde_json::json!({}))
            .await
            .unwrap_err();
        // Reached the single-segment route with the slash intact.
        assert_eq!(applied.status(), Some(400));

        let applied = api
            .apply_sandbox("feature x", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(applied.sandbox.name, "feature x");

        let mut url = api.org_url(&["local", "sandboxes", "watch"]);
        url.query_pairs_mut().append_pair("machineID", "m a&b=c");
        assert_eq!(url.query(), Some("machineID=m+a%26b%3Dc"));
    }

    #[tokio::test]
    async fn test_watch_sandbox_until_deleted() {
        let base = serve(fake_api()).await;
        let api = HttpSandboxApi::new(&base, "acme", "key").unwrap();

        let mut stream = api.watch_sandbox("sb1").await.unwrap();
        let sandbox = stream.next().await.unwrap().unwrap();
        assert_eq!(sandbox.name, "sb1");
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code, WatchCode::NotFound);
        assert!(stream.next().await.is_none());

        let err = match api.watch_sandbox("gone").await {
            Ok(_) => panic!("watch of a deleted sandbox should fail"),
            Err(e) => e,
        };
        assert_eq!(err.code, WatchCode::NotFound);
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpSandboxApi::new("not a url", "acme", "key").is_err());
        assert!(HttpSandboxApi::new("mailto:ops@example.com", "acme", "key").is_err());
    }

    #[tokio::test]
    async fn test_watch_http_error_is_classified() {
        let base = serve(fake_api()).await;
        let api = HttpSandboxApi::new(&base, "denied", "key").unwrap();

        let err = match api.watch_local_sandboxes("m-abc").await {
            Ok(_) => panic!("watch should fail"),
            Err(e) => e,
        };
        assert_eq!(err.code, WatchCode::PermissionDenied);
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_is_transient() {
        let api = HttpSandboxApi::new("http://127.0.0.1:1", "acme", "key").unwrap();
        let err = match api.watch_local_sandboxes("m-abc").await {
            Ok(_) => panic!("watch should fail"),
            Err(e) => e,
        };
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline() {
        let chunks: Vec<std::result::Result<&'static [u8], std::io::Error>> = vec![
            Ok(br#"{"sandboxes":[{"name":"a","#.as_slice()),
            Ok(br#""routingKey":"rk"}]}"#.as_slice()),
        ];
        let mut stream = ndjson_events(futures_util::stream::iter(chunks), WatchEvent::decode);
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event[0].name, "a");
        assert_eq!(
            stream.next().await.unwrap().unwrap_err().code,
            WatchCode::Unavailable
        );
    }
}
