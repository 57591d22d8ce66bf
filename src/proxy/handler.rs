//! Request pipeline
//!
//! Credential parsing → key draw → header sanitization → upstream call →
//! streaming relay. The key is drawn once per request and never re-resolved
//! while the response streams.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use hyper::{Request, Response};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{redact, UpstreamConfig};
use crate::error::{GatewayError, Result};
use crate::proxy::cancel::Cancellation;
use crate::proxy::forwarder::Forwarder;
use crate::proxy::middleware::{client_ip, sanitize, AuthOutcome, Credential};
use crate::proxy::relay::{RelayBody, StreamingRelay};
use crate::proxy::rotation::{KeyRotator, RotationStore};

/// Proxy request handler
pub struct ProxyHandler {
    rotator: KeyRotator,
    forwarder: Forwarder,
    relay: StreamingRelay,
}

impl ProxyHandler {
    pub fn new(config: &UpstreamConfig, store: Arc<dyn RotationStore>) -> Result<Self> {
        Ok(Self {
            rotator: KeyRotator::new(config.keys.clone(), store),
            forwarder: Forwarder::new(config)?,
            relay: StreamingRelay::new(config.idle_timeout, config.flush),
        })
    }

    pub fn base_url(&self) -> &str {
        self.forwarder.base_url()
    }

    /// Handle one inbound request; failures become client-facing responses
    #[instrument(
        skip_all,
        fields(request_id = %Uuid::new_v4(), method = %req.method(), path = %req.uri().path())
    )]
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        remote_addr: Option<SocketAddr>,
        cancel: Cancellation,
    ) -> Response<RelayBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match self.proxy(req, remote_addr, cancel).await {
            Ok(response) => {
                info!(status = response.status().as_u16(), "Relaying upstream response");
                response
            }
            Err(e) => {
                if e.is_client_error() {
                    warn!(error = %e, "Rejected request");
                } else if matches!(e, GatewayError::ClientDisconnected) {
                    info!("Client disconnected before response");
                } else {
                    error!(error = %e, "Request failed");
                }
                e.into_response()
            }
        }
    }

    async fn proxy<B>(
        &self,
        req: Request<B>,
        remote_addr: Option<SocketAddr>,
        cancel: Cancellation,
    ) -> Result<Response<RelayBody>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (mut parts, body) = req.into_parts();

        let credential = AuthOutcome::from_headers(&parts.headers).into_credential()?;
        let upstream_credential = match self.rotator.resolve(&credential).await {
            Ok(resolved) => resolved,
            Err(e) => {
                if let (GatewayError::UnknownToken, Credential::Virtual(token)) = (&e, &credential) {
                    warn!(token = %redact(token), "Unknown virtual token");
                }
                return Err(e);
            }
        };

        info!(
            token_class = upstream_credential.class.as_str(),
            key_index = ?upstream_credential.key_index,
            "Resolved upstream credential"
        );

        let caller = client_ip(&parts.headers, remote_addr);
        sanitize(&mut parts.headers);

        let request = self
            .forwarder
            .build(&parts, body, &upstream_credential, &caller)?;
        let mut response = self.forwarder.send(request, cancel.clone()).await?;

        let status = response.status();
        let headers = std::mem::take(response.headers_mut());
        let upstream = response
            .bytes_stream()
            .map_err(|e| GatewayError::StreamRead(e.to_string()))
            .boxed();

        self.relay.relay(status, headers, upstream, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlushGranularity;
    use crate::proxy::cancel::cancellation;
    use crate::proxy::rotation::InMemoryRotationTable;
    use http_body_util::{BodyExt, Full, StreamBody};
    use hyper::body::{Frame, Incoming};
    use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::StatusCode;
    use hyper_util::rt::TokioIo;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// What the fake upstream saw
    #[derive(Debug)]
    struct Seen {
        method: String,
        path_and_query: String,
        authorization: Option<String>,
        forwarded_for: Option<String>,
        relay_user: Option<String>,
        body: Bytes,
    }

    const STREAMED: &[&str] = &["data: ", "h\u{e9}", "llo ", "\u{4e16}\u{754c}", "\n\n"];

    /// Start an upstream that records each request and streams a reply
    async fn spawn_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<Seen>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let tx = tx.clone();
                        async move {
                            let header = |name: &str| {
                                req.headers()
                                    .get(name)
                                    .and_then(|v| v.to_str().ok())
                                    .map(str::to_string)
                            };
                            let seen = Seen {
                                method: req.method().to_string(),
                                path_and_query: req
                                    .uri()
                                    .path_and_query()
                                    .map(|pq| pq.to_string())
                                    .unwrap_or_default(),
                                authorization: header("authorization"),
                                forwarded_for: header("x-forwarded-for"),
                                relay_user: header("helicone-user-id"),
                                body: Bytes::new(),
                            };
                            let body = req.into_body().collect().await.unwrap().to_bytes();
                            let _ = tx.send(Seen { body, ..seen });

                            let chunks = STREAMED
                                .iter()
                                .copied()
                                .map(|c: &'static str| {
                                    Ok::<_, Infallible>(Frame::data(Bytes::from_static(
                                        c.as_bytes(),
                                    )))
                                })
                                .collect::<Vec<_>>();
                            let body = StreamBody::new(futures::stream::iter(chunks));
                            Ok::<_, Infallible>(
                                Response::builder()
                                    .status(StatusCode::ACCEPTED)
                                    .header(CONTENT_TYPE, "text/event-stream")
                                    .header("x-upstream", "yes")
                                    .body(body)
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (addr, rx)
    }

    fn handler(base_url: String, relay_key: Option<&str>) -> ProxyHandler {
        let mut keys = HashMap::new();
        keys.insert(
            "genai-abc".to_string(),
            vec!["k1".to_string(), "k2".to_string()],
        );
        let config = UpstreamConfig {
            keys,
            base_url: Some(base_url),
            relay_key: relay_key.map(str::to_string),
            connect_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(5),
            flush: FlushGranularity::Char,
        };
        ProxyHandler::new(&config, Arc::new(InMemoryRotationTable::new())).unwrap()
    }

    fn request(auth: Option<&str>, body: &'static str) -> Request<Full<Bytes>> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions?stream=true")
            .header(CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "203.0.113.7")
            .header("cf-ray", "abc123");
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap()
    }

    async fn body_text(response: Response<RelayBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_and_malformed_auth() {
        let handler = handler("http://127.0.0.1:9".to_string(), None);
        let (_trigger, cancel) = cancellation();

        let response = handler.handle(request(None, ""), None, cancel.clone()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Authorization header is missing");

        let response = handler
            .handle(request(Some("Token abc"), ""), None, cancel)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_text(response).await,
            "Invalid Authorization header format"
        );
    }

    #[tokio::test]
    async fn test_unknown_virtual_token_forbidden() {
        let handler = handler("http://127.0.0.1:9".to_string(), None);
        let (_trigger, cancel) = cancellation();

        let response = handler
            .handle(request(Some("Bearer genai-missing"), ""), None, cancel)
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_text(response).await,
            r#"{"error":{"message":"Invalid Token","code":403}}"#
        );
    }

    #[tokio::test]
    async fn test_virtual_token_rotates_and_streams() {
        let (addr, mut seen) = spawn_upstream().await;
        let handler = handler(format!("http://{}", addr), None);
        let (_trigger, cancel) = cancellation();

        for expected_key in ["k1", "k2", "k1"] {
            let response = handler
                .handle(
                    request(Some("Bearer genai-abc"), r#"{"model":"m"}"#),
                    None,
                    cancel.clone(),
                )
                .await;

            assert_eq!(response.status(), StatusCode::ACCEPTED);
            assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
            assert_eq!(
                response.headers().get(CONTENT_TYPE).unwrap(),
                "text/event-stream"
            );
            assert_eq!(body_text(response).await, STREAMED.concat());

            let seen = seen.recv().await.unwrap();
            assert_eq!(seen.method, "POST");
            assert_eq!(seen.path_and_query, "/v1/chat/completions?stream=true");
            assert_eq!(
                seen.authorization.as_deref(),
                Some(format!("Bearer {}", expected_key).as_str())
            );
            assert_eq!(seen.forwarded_for, None);
            assert_eq!(seen.body, Bytes::from_static(br#"{"model":"m"}"#));
        }
    }

    #[tokio::test]
    async fn test_direct_token_forwarded_verbatim_with_relay_headers() {
        let (addr, mut seen) = spawn_upstream().await;
        let handler = handler(format!("http://{}", addr), Some("relay-secret"));
        let (_trigger, cancel) = cancellation();
        let remote: SocketAddr = "192.0.2.1:40000".parse().unwrap();

        let response = handler
            .handle(request(Some("Bearer sk-xyz"), "{}"), Some(remote), cancel)
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let _ = body_text(response).await;

        let seen = seen.recv().await.unwrap();
        assert_eq!(seen.authorization.as_deref(), Some("Bearer sk-xyz"));
        assert_eq!(seen.relay_user.as_deref(), Some("203.0.113.7"));
        assert_eq!(seen.forwarded_for, None);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_internal_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handler = handler(format!("http://{}", addr), None);
        let (_trigger, cancel) = cancellation();

        let response = handler
            .handle(request(Some("Bearer sk-xyz"), "{}"), None, cancel)
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "Error sending proxy request");
    }

    /// Upstream that reads requests but never answers
    async fn spawn_silent_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_silent_upstream_times_out() {
        let addr = spawn_silent_upstream().await;
        let config = UpstreamConfig {
            base_url: Some(format!("http://{}", addr)),
            connect_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let handler = ProxyHandler::new(&config, Arc::new(InMemoryRotationTable::new())).unwrap();
        let (_trigger, cancel) = cancellation();

        let response = tokio::time::timeout(
            Duration::from_secs(3),
            handler.handle(request(Some("Bearer sk-xyz"), "{}"), None, cancel),
        )
        .await
        .expect("handler kept waiting on a silent upstream");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_text(response).await, "Error reading upstream response");
    }
}
