use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A single JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default, deserialize_with = "deserialize_params")]
    pub params: Vec<Value>,
}

/// A single JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded request body.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedBody {
    Single(JsonRpcRequest),
    /// Batch entries in request order; `None` marks an entry that is not a
    /// usable request but still needs a positional response.
    Batch(Vec<Option<JsonRpcRequest>>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("request body is not a JSON-RPC request or batch: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("request has an empty method")]
    EmptyMethod,
}

fn default_version() -> String {
    "2.0".to_string()
}

fn deserialize_params<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Value>, D::Error> {
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl JsonRpcRequest {
    pub fn new(id: Value, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            method: method.into(),
            params,
        }
    }
}

impl JsonRpcResponse {
    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: Some(result),
            error: None,
        }
    }
}

/// Decode a request body. A single object is tried first, then an array.
///
/// The input is never modified so callers can pass the original bytes
/// through on failure.
pub fn decode(body: &[u8]) -> Result<DecodedBody, DecodeError> {
    let single_err = match serde_json::from_slice::<JsonRpcRequest>(body) {
        Ok(req) if req.method.is_empty() => return Err(DecodeError::EmptyMethod),
        Ok(req) => return Ok(DecodedBody::Single(req)),
        Err(e) => e,
    };

    match serde_json::from_slice::<Vec<Value>>(body) {
        Ok(entries) => Ok(DecodedBody::Batch(
            entries.into_iter().map(decode_batch_entry).collect(),
        )),
        Err(_) => Err(DecodeError::Malformed(single_err)),
    }
}

fn decode_batch_entry(entry: Value) -> Option<JsonRpcRequest> {
    if !entry.is_object() {
        return None;
    }
    serde_json::from_value::<JsonRpcRequest>(entry)
        .ok()
        .filter(|req| !req.method.is_empty())
}

/// Render `val` as JSON for logging, cut to at most `max_len` bytes.
/// Appends "..." and the full size when truncated.
pub fn truncate_json<T: Serialize + ?Sized>(val: &T, max_len: usize) -> String {
    let s = serde_json::to_string(val).unwrap_or_default();
    if s.len() <= max_len {
        return s;
    }
    let mut cut = max_len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... ({} bytes)", &s[..cut], s.len())
}
