use serde_json::Value;

use crate::cache::CacheTtl;
use crate::config::TtlConfig;
use crate::rpc::height::{HeightReference, MethodClass, classify};
use crate::rpc::types::JsonRpcResponse;

/// Whether a request may be answered from, and stored in, the cache.
///
/// Static and tx-hash methods always qualify. Height-bearing methods only
/// qualify for a concrete block number above zero; tags track the chain tip
/// and are never cached.
pub fn is_request_cacheable(method: &str, height: Option<HeightReference>) -> bool {
    match classify(method) {
        MethodClass::Static | MethodClass::TxHash => true,
        _ => height.is_some_and(HeightReference::is_concrete_positive),
    }
}

/// Results that carry no information worth caching.
fn is_empty_result(result: &Value) -> bool {
    match result {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty() || s == "0x" || s == "0x0",
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// A transaction object without block inclusion fields is still pending.
fn is_pending_transaction(result: &Value) -> bool {
    ["blockHash", "blockNumber", "transactionIndex"]
        .iter()
        .any(|field| result.get(field).is_none_or(Value::is_null))
}

/// Whether a backend response may be stored for `method`.
pub fn is_cacheable(resp: &JsonRpcResponse, method: &str) -> bool {
    if resp.error.is_some() {
        return false;
    }
    let Some(result) = resp.result.as_ref() else {
        return false;
    };
    if is_empty_result(result) {
        return false;
    }
    if method == "eth_getTransactionByHash" && is_pending_transaction(result) {
        return false;
    }
    true
}

/// Decode a raw backend body and return it only if it is cacheable.
pub fn decode_cacheable(body: &[u8], method: &str) -> Option<JsonRpcResponse> {
    if body.is_empty() {
        return None;
    }
    let resp: JsonRpcResponse = serde_json::from_slice(body).ok()?;
    is_cacheable(&resp, method).then_some(resp)
}

/// Store TTL for a method's class. `None` means the class is not cached.
pub fn ttl_for_method(ttl: &TtlConfig, method: &str) -> Option<CacheTtl> {
    match classify(method) {
        MethodClass::Static => ttl.static_methods.as_cache_ttl(),
        MethodClass::BlockNumber(_) => ttl.block_number.as_cache_ttl(),
        MethodClass::BlockHash(_) | MethodClass::TxHash => ttl.block_hash.as_cache_ttl(),
        MethodClass::Other => None,
    }
}
