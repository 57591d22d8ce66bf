//! Outbound request assembly and dispatch
//!
//! Reuses the inbound method, path, query and body stream; swaps in the
//! resolved upstream credential and, when a telemetry relay is configured,
//! adds the relay headers.

use std::time::Duration;

use bytes::Bytes;
use futures::{future, StreamExt};
use http::request::Parts;
use http_body_util::BodyStream;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};
use tracing::{debug, error, instrument};
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};
use crate::proxy::cancel::Cancellation;
use crate::proxy::rotation::UpstreamCredential;
use crate::proxy::upstream::resolve_base_url;

/// Relay authentication header
pub const RELAY_AUTH_HEADER: &str = "helicone-auth";

/// Caller attribution header sent to the relay
pub const RELAY_USER_HEADER: &str = "helicone-user-id";

/// Builds and sends upstream requests
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    base_url: String,
    relay_key: Option<String>,
    head_timeout: Duration,
}

impl Forwarder {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .no_proxy()
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: resolve_base_url(config).to_string(),
            relay_key: config.relay_key.clone().filter(|k| !k.is_empty()),
            head_timeout: config.idle_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve the inbound path and query against the base URL
    pub fn target_url(&self, parts: &Parts) -> Result<Url> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        Url::parse(&format!("{}{}", self.base_url, path_and_query))
            .map_err(|e| GatewayError::UpstreamRequestBuild(e.to_string()))
    }

    /// Assemble the outbound request. `parts.headers` must already be
    /// sanitized.
    pub fn build<B>(
        &self,
        parts: &Parts,
        body: B,
        credential: &UpstreamCredential,
        client_ip: &str,
    ) -> Result<reqwest::Request>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let url = self.target_url(parts)?;
        let relay = self.relay_key.as_deref().map(|key| (key, client_ip));
        let headers = outbound_headers(&parts.headers, credential, relay)?;

        debug!(url = %url, "Built upstream request");

        self.client
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(stream_body(body))
            .build()
            .map_err(|e| GatewayError::UpstreamRequestBuild(e.to_string()))
    }

    /// Issue the request, giving up if the client goes away first or the
    /// upstream sends no response head within the idle timeout
    #[instrument(skip_all, fields(url = %request.url()))]
    pub async fn send(
        &self,
        request: reqwest::Request,
        cancel: Cancellation,
    ) -> Result<reqwest::Response> {
        let response = tokio::time::timeout(self.head_timeout, self.client.execute(request));
        tokio::select! {
            response = response => match response {
                Ok(response) => response.map_err(|e| {
                    error!(error = %e, "Error sending proxy request");
                    GatewayError::UpstreamCall(e)
                }),
                Err(_) => {
                    error!(timeout = ?self.head_timeout, "Upstream sent no response head");
                    Err(GatewayError::IdleTimeout)
                }
            },
            _ = cancel.cancelled() => {
                debug!("Client went away before upstream responded");
                Err(GatewayError::ClientDisconnected)
            }
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stream the inbound body upstream without buffering
fn stream_body<B>(body: B) -> reqwest::Body
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let data = BodyStream::new(body).filter_map(|frame| {
        future::ready(match frame {
            Ok(frame) => frame.into_data().ok().map(Ok),
            Err(e) => Some(Err::<Bytes, BoxError>(e.into())),
        })
    });
    reqwest::Body::wrap_stream(data)
}

/// Headers for the upstream request
///
/// Hop-by-hop headers and `host` are dropped, the credential is rewritten,
/// and `content-type`/`transfer-encoding` are re-asserted from the inbound
/// values.
pub fn outbound_headers(
    inbound: &HeaderMap,
    credential: &UpstreamCredential,
    relay: Option<(&str, &str)>,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 2);
    for (name, value) in inbound {
        if !is_hop_by_hop_header(name.as_str()) && *name != HOST {
            headers.append(name.clone(), value.clone());
        }
    }

    for name in [CONTENT_TYPE, TRANSFER_ENCODING] {
        if let Some(value) = inbound.get(&name) {
            headers.insert(name, value.clone());
        }
    }

    headers.insert(AUTHORIZATION, sensitive(&credential.bearer())?);

    if let Some((relay_key, client_ip)) = relay {
        headers.insert(
            HeaderName::from_static(RELAY_AUTH_HEADER),
            sensitive(&format!("Bearer {}", relay_key))?,
        );
        if !client_ip.is_empty() {
            let value = HeaderValue::from_str(client_ip)
                .map_err(|e| GatewayError::UpstreamRequestBuild(e.to_string()))?;
            headers.insert(HeaderName::from_static(RELAY_USER_HEADER), value);
        }
    }

    Ok(headers)
}

fn sensitive(value: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(value).map_err(|_| {
        GatewayError::UpstreamRequestBuild("credential is not a valid header value".into())
    })?;
    value.set_sensitive(true);
    Ok(value)
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
