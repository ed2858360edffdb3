use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, header};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::router::BackendTarget;
use crate::upstream::{Transport, TransportError, UpstreamReply};

const USER_AGENT: &str = concat!("sluice/", env!("CARGO_PKG_VERSION"));

/// Headers that describe a single hop and must not be forwarded. Content
/// coding is negotiated by the client itself so replies arrive decoded.
const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
    header::TRAILER,
    header::PROXY_AUTHORIZATION,
    header::ACCEPT_ENCODING,
];

/// Strip hop-by-hop headers from a header map.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in &HOP_BY_HOP {
        out.remove(name);
    }
    out.remove("keep-alive");
    out
}

/// Forwards raw request bodies to backends over HTTP.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .pool_max_idle_per_host(32)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn forward(
        &self,
        target: &BackendTarget,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamReply, TransportError> {
        let start = std::time::Instant::now();
        let response = self
            .client
            .post(target.url.as_str())
            .headers(forwardable_headers(headers))
            .body(body)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                backend: target.name.clone(),
                source,
            })?;

        let status = response.status();
        let reply_headers = forwardable_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|source| TransportError::Request {
                backend: target.name.clone(),
                source,
            })?;

        let elapsed = start.elapsed();
        debug!(backend = %target.name, status = %status, elapsed_ms = %elapsed.as_millis(), "backend response");
        metrics::histogram!("sluice_backend_request_duration_seconds", "backend" => target.name.clone())
            .record(elapsed.as_secs_f64());

        Ok(UpstreamReply {
            status,
            headers: reply_headers,
            body,
        })
    }
}
