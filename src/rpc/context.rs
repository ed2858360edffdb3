use std::time::Instant;

use axum::body::Bytes;
use axum::http::HeaderMap;

use crate::cache::middleware::CacheLookup;
use crate::rpc::height::HeightReference;
use crate::rpc::types::JsonRpcRequest;

/// Per-request state threaded through the single-request path.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub host: String,
    pub headers: HeaderMap,
    /// Original body, forwarded untouched on a cache miss.
    pub body: Bytes,
    /// `None` when the body did not decode as a single request.
    pub envelope: Option<JsonRpcRequest>,
    pub height: Option<HeightReference>,
    pub cache: CacheLookup,
    pub started: Instant,
    pub in_batch: bool,
}

impl RequestContext {
    pub fn new(host: String, headers: HeaderMap, body: Bytes, envelope: Option<JsonRpcRequest>) -> Self {
        Self {
            host,
            headers,
            body,
            envelope,
            height: None,
            cache: CacheLookup::Skipped,
            started: Instant::now(),
            in_batch: false,
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.envelope.as_ref().map(|r| r.method.as_str())
    }
}
