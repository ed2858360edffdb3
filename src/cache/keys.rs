use blake3::Hasher;
use serde_json::{Map, Value};

use crate::rpc::types::JsonRpcRequest;

/// Item type tag for cached query responses.
pub const QUERY_ITEM: &str = "query";

const DELIMITER: char = ':';

/// Build the cache key for a request.
///
/// Format: `query:{chain}:{method}:{blake3(method ++ params)}`. Params are
/// serialized with sorted object keys, so the key depends only on method
/// and params, never on the request id.
pub fn cache_key(chain: &str, req: &JsonRpcRequest) -> Result<String, serde_json::Error> {
    let params: Vec<Value> = req.params.iter().map(canonical).collect();
    let params = serde_json::to_vec(&params)?;

    let mut hasher = Hasher::new();
    hasher.update(req.method.as_bytes());
    hasher.update(&params);
    let hash = hasher.finalize();

    Ok(format!(
        "{QUERY_ITEM}{DELIMITER}{chain}{DELIMITER}{}{DELIMITER}{}",
        req.method,
        hash.to_hex()
    ))
}

/// Copy of `value` with every object's keys inserted in sorted order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonical(&obj[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Prefix shared by all query keys of a chain.
pub fn chain_prefix(chain: &str) -> String {
    format!("{QUERY_ITEM}{DELIMITER}{chain}{DELIMITER}")
}
