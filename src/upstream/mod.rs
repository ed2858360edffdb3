pub mod client;
pub mod headers;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use thiserror::Error;

use crate::router::BackendTarget;

/// Raw reply from a backend.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to backend {backend} failed: {source}")]
    Request {
        backend: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Byte-level forwarding to a backend.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn forward(
        &self,
        target: &BackendTarget,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamReply, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
}

#[derive(Debug, Error)]
pub enum HeaderSourceError {
    #[error("header request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("node returned an error: {0}")]
    Rpc(String),
    #[error("malformed block header: {0}")]
    Malformed(String),
}

/// Looks up block headers by hash.
#[async_trait]
pub trait BlockHeaderSource: Send + Sync {
    async fn header_by_hash(&self, hash: &str) -> Result<Option<BlockHeader>, HeaderSourceError>;
}

/// Header source for deployments without one configured: every hash is
/// unknown.
pub struct NoHeaderSource;

#[async_trait]
impl BlockHeaderSource for NoHeaderSource {
    async fn header_by_hash(&self, _hash: &str) -> Result<Option<BlockHeader>, HeaderSourceError> {
        Ok(None)
    }
}
