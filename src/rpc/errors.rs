use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use serde_json::Value;
use thiserror::Error;

use crate::cache::middleware::{CACHE_STATUS_HEADER, CacheStatus};
use crate::rpc::handler::ProxyResponse;
use crate::rpc::types::JsonRpcResponse;
use crate::upstream::TransportError;

/// Failures surfaced to the client. Classification and cache errors never
/// end up here; they degrade to a default route or a cache miss.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("batch of {size} requests exceeds limit of {limit}")]
    BatchSizeExceeded { size: usize, limit: usize },

    #[error("no backend configured for host {0}")]
    RoutingNotFound(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BatchSizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::RoutingNotFound(_) | ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn code(&self) -> i64 {
        match self {
            ProxyError::BatchSizeExceeded { .. } => -32600,
            ProxyError::RoutingNotFound(_) | ProxyError::Transport(_) => -32603,
        }
    }

    /// JSON-RPC error response carrying the request id.
    pub fn to_response(&self, id: Value) -> ProxyResponse {
        json_response(
            self.status(),
            &JsonRpcResponse::error(id, self.code(), self.to_string()),
        )
    }
}

/// Serialize a JSON-RPC response produced by the proxy itself. Nothing
/// came from the cache, so the cache status is always MISS.
pub fn json_response(status: StatusCode, resp: &JsonRpcResponse) -> ProxyResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_STATUS_HEADER, CacheStatus::Miss.header_value());
    ProxyResponse {
        status,
        headers,
        body: serde_json::to_vec(resp).map(Bytes::from).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::BatchSizeExceeded { size: 3, limit: 2 }.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ProxyError::RoutingNotFound("x".to_string()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response_echoes_id() {
        let resp = ProxyError::RoutingNotFound("rpc.unknown".to_string()).to_response(json!("abc"));
        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
        assert_eq!(resp.cache_status(), Some("MISS"));
        let body: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["id"], json!("abc"));
        assert_eq!(body["error"]["code"], json!(-32603));
        assert!(body["error"]["message"].as_str().unwrap().contains("rpc.unknown"));
    }
}
