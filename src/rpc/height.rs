//! Block height extraction for EVM JSON-RPC requests.
//!
//! A [`HeightReference`] is a signed height: non-negative values are concrete
//! block numbers, negative values are fixed sentinels for the named block tags.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::U256;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::rpc::types::JsonRpcRequest;
use crate::upstream::BlockHeaderSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeightReference(pub i64);

impl HeightReference {
    pub const PENDING: Self = Self(-1);
    pub const LATEST: Self = Self(-2);
    pub const FINALIZED: Self = Self(-3);
    pub const SAFE: Self = Self(-4);
    pub const EARLIEST: Self = Self(-5);
    /// The method takes a height but the request did not supply one.
    pub const EMPTY: Self = Self(-6);

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "latest" => Some(Self::LATEST),
            "pending" => Some(Self::PENDING),
            "finalized" => Some(Self::FINALIZED),
            "safe" => Some(Self::SAFE),
            "earliest" => Some(Self::EARLIEST),
            "" => Some(Self::EMPTY),
            _ => None,
        }
    }

    /// Concrete block number greater than zero.
    pub fn is_concrete_positive(self) -> bool {
        self.0 > 0
    }

    /// Tags whose answer tracks the chain tip (latest, pending, finalized,
    /// safe) plus the empty tag, which nodes treat as latest.
    pub fn is_tip(self) -> bool {
        matches!(
            self,
            Self::LATEST | Self::PENDING | Self::FINALIZED | Self::SAFE | Self::EMPTY
        )
    }
}

impl fmt::Display for HeightReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LATEST => f.write_str("latest"),
            Self::PENDING => f.write_str("pending"),
            Self::FINALIZED => f.write_str("finalized"),
            Self::SAFE => f.write_str("safe"),
            Self::EARLIEST => f.write_str("earliest"),
            Self::EMPTY => f.write_str("empty"),
            Self(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeightError {
    #[error("request has no method")]
    NotAnApiRequest,
    #[error("method {0} does not take a block height")]
    NotHeightBearing(String),
    #[error("unparseable block height: {0}")]
    UnparseableHeight(String),
}

/// How a method refers to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodClass {
    /// Answer never changes for a chain (chain id and friends).
    Static,
    /// Block number or tag at the given parameter position.
    BlockNumber(usize),
    /// Block hash at the given parameter position.
    BlockHash(usize),
    /// Transaction hash lookup; finality is judged on the response.
    TxHash,
    Other,
}

pub fn classify(method: &str) -> MethodClass {
    match method {
        "eth_chainId" | "net_version" | "web3_clientVersion" => MethodClass::Static,

        "eth_getBlockByNumber"
        | "eth_getBlockTransactionCountByNumber"
        | "eth_getUncleCountByBlockNumber"
        | "eth_getTransactionByBlockNumberAndIndex"
        | "eth_getUncleByBlockNumberAndIndex"
        | "eth_getBlockReceipts"
        | "debug_traceBlockByNumber"
        | "trace_block" => MethodClass::BlockNumber(0),
        "eth_getBalance" | "eth_getTransactionCount" | "eth_getCode" | "eth_call" => {
            MethodClass::BlockNumber(1)
        }
        "eth_getStorageAt" | "eth_getProof" => MethodClass::BlockNumber(2),

        "eth_getBlockByHash"
        | "eth_getBlockTransactionCountByHash"
        | "eth_getUncleCountByBlockHash"
        | "eth_getTransactionByBlockHashAndIndex"
        | "eth_getUncleByBlockHashAndIndex"
        | "debug_traceBlockByHash" => MethodClass::BlockHash(0),

        "eth_getTransactionByHash" | "eth_getTransactionReceipt" => MethodClass::TxHash,

        _ => MethodClass::Other,
    }
}

/// Methods that never need historical state and can always be served by a
/// pruning node.
pub fn needs_no_history(method: &str) -> bool {
    matches!(
        method,
        "eth_chainId"
            | "net_version"
            | "net_listening"
            | "net_peerCount"
            | "web3_clientVersion"
            | "web3_sha3"
            | "eth_blockNumber"
            | "eth_gasPrice"
            | "eth_maxPriorityFeePerGas"
            | "eth_syncing"
            | "eth_protocolVersion"
            | "eth_sendRawTransaction"
            | "eth_sendTransaction"
    )
}

/// Parse the height of a by-number method without touching the network.
///
/// By-hash methods are reported as [`HeightError::NotHeightBearing`] here;
/// resolving them needs a header source, see [`extract_height`].
pub fn block_number_param(req: &JsonRpcRequest) -> Result<HeightReference, HeightError> {
    if req.method.is_empty() {
        return Err(HeightError::NotAnApiRequest);
    }
    let MethodClass::BlockNumber(position) = classify(&req.method) else {
        return Err(HeightError::NotHeightBearing(req.method.clone()));
    };

    match req.params.get(position) {
        None | Some(Value::Null) => Ok(HeightReference::EMPTY),
        Some(Value::String(s)) => parse_height(s),
        Some(Value::Number(n)) => n
            .as_i64()
            .filter(|n| *n >= 0)
            .map(HeightReference)
            .ok_or_else(|| HeightError::UnparseableHeight(n.to_string())),
        // EIP-1898 block object: {"blockNumber": ...} or {"blockHash": ...}
        Some(Value::Object(obj)) => match obj.get("blockNumber").and_then(Value::as_str) {
            Some(s) => parse_height(s),
            None => Err(HeightError::UnparseableHeight(
                Value::Object(obj.clone()).to_string(),
            )),
        },
        Some(other) => Err(HeightError::UnparseableHeight(other.to_string())),
    }
}

/// Parse a tag or a hex/decimal block number.
pub fn parse_height(raw: &str) -> Result<HeightReference, HeightError> {
    if let Some(tag) = HeightReference::from_tag(raw) {
        return Ok(tag);
    }
    let value =
        U256::from_str(raw).map_err(|_| HeightError::UnparseableHeight(raw.to_string()))?;
    u64::try_from(value)
        .ok()
        .and_then(|n| i64::try_from(n).ok())
        .map(HeightReference)
        .ok_or_else(|| HeightError::UnparseableHeight(raw.to_string()))
}

/// Derive the block height a request refers to.
///
/// By-hash methods are resolved through `headers`; an unknown hash or a
/// failed lookup yields [`HeightError::UnparseableHeight`].
pub async fn extract_height(
    req: &JsonRpcRequest,
    headers: &dyn BlockHeaderSource,
) -> Result<HeightReference, HeightError> {
    if req.method.is_empty() {
        return Err(HeightError::NotAnApiRequest);
    }
    match classify(&req.method) {
        MethodClass::BlockNumber(_) => block_number_param(req),
        MethodClass::BlockHash(position) => {
            let hash = req
                .params
                .get(position)
                .and_then(Value::as_str)
                .ok_or_else(|| HeightError::UnparseableHeight("missing block hash".to_string()))?;
            match headers.header_by_hash(hash).await {
                Ok(Some(header)) => i64::try_from(header.number)
                    .map(HeightReference)
                    .map_err(|_| HeightError::UnparseableHeight(hash.to_string())),
                Ok(None) => Err(HeightError::UnparseableHeight(hash.to_string())),
                Err(e) => {
                    debug!(hash = %hash, error = %e, "block header lookup failed");
                    Err(HeightError::UnparseableHeight(hash.to_string()))
                }
            }
        }
        MethodClass::Static | MethodClass::TxHash | MethodClass::Other => {
            Err(HeightError::NotHeightBearing(req.method.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{BlockHeader, HeaderSourceError};
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedHeaders;

    #[async_trait]
    impl BlockHeaderSource for FixedHeaders {
        async fn header_by_hash(&self, hash: &str) -> Result<Option<BlockHeader>, HeaderSourceError> {
            match hash {
                "0xknown" => Ok(Some(BlockHeader {
                    number: 77,
                    hash: hash.to_string(),
                })),
                "0xbroken" => Err(HeaderSourceError::Rpc("boom".to_string())),
                _ => Ok(None),
            }
        }
    }

    fn req(method: &str, params: Vec<Value>) -> JsonRpcRequest {
        JsonRpcRequest::new(json!(1), method, params)
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!(parse_height("latest").unwrap(), HeightReference::LATEST);
        assert_eq!(parse_height("pending").unwrap(), HeightReference::PENDING);
        assert_eq!(parse_height("earliest").unwrap(), HeightReference::EARLIEST);
        assert_eq!(parse_height("finalized").unwrap(), HeightReference::FINALIZED);
        assert_eq!(parse_height("safe").unwrap(), HeightReference::SAFE);
        assert_eq!(parse_height("").unwrap(), HeightReference::EMPTY);
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_height("0x2").unwrap(), HeightReference(2));
        assert_eq!(parse_height("0x0").unwrap(), HeightReference(0));
        assert_eq!(parse_height("100").unwrap(), HeightReference(100));
    }

    #[test]
    fn test_parse_rejects_overflow_and_garbage() {
        assert!(matches!(
            parse_height("0x8000000000000000"),
            Err(HeightError::UnparseableHeight(_))
        ));
        assert!(matches!(
            parse_height("0xffffffffffffffffffffffffffffffffff"),
            Err(HeightError::UnparseableHeight(_))
        ));
        assert!(matches!(
            parse_height("yesterday"),
            Err(HeightError::UnparseableHeight(_))
        ));
    }

    #[test]
    fn test_block_number_param_positions() {
        let r = req("eth_getBalance", vec![json!("0xabc"), json!("0x10")]);
        assert_eq!(block_number_param(&r).unwrap(), HeightReference(16));

        let r = req(
            "eth_getStorageAt",
            vec![json!("0xabc"), json!("0x0"), json!("latest")],
        );
        assert_eq!(block_number_param(&r).unwrap(), HeightReference::LATEST);
    }

    #[test]
    fn test_block_number_param_missing_is_empty() {
        let r = req("eth_getBalance", vec![json!("0xabc")]);
        assert_eq!(block_number_param(&r).unwrap(), HeightReference::EMPTY);
    }

    #[test]
    fn test_block_number_param_object_form() {
        let r = req(
            "eth_call",
            vec![json!({"to": "0x1"}), json!({"blockNumber": "0x5"})],
        );
        assert_eq!(block_number_param(&r).unwrap(), HeightReference(5));
    }

    #[test]
    fn test_block_number_param_errors() {
        assert_eq!(
            block_number_param(&req("", vec![])),
            Err(HeightError::NotAnApiRequest)
        );
        assert!(matches!(
            block_number_param(&req("eth_chainId", vec![])),
            Err(HeightError::NotHeightBearing(_))
        ));
        assert!(matches!(
            block_number_param(&req("eth_getBlockByNumber", vec![json!(true)])),
            Err(HeightError::UnparseableHeight(_))
        ));
    }

    #[test]
    fn test_extraction_does_not_mutate() {
        let r = req("eth_getBlockByNumber", vec![json!("0x2"), json!(false)]);
        let before = r.clone();
        let _ = block_number_param(&r);
        assert_eq!(r, before);
    }

    #[tokio::test]
    async fn test_extract_height_by_hash() {
        let r = req("eth_getBlockByHash", vec![json!("0xknown"), json!(false)]);
        assert_eq!(
            extract_height(&r, &FixedHeaders).await.unwrap(),
            HeightReference(77)
        );

        let r = req("eth_getBlockByHash", vec![json!("0xunknown"), json!(false)]);
        assert!(matches!(
            extract_height(&r, &FixedHeaders).await,
            Err(HeightError::UnparseableHeight(_))
        ));

        let r = req("eth_getBlockByHash", vec![json!("0xbroken"), json!(false)]);
        assert!(matches!(
            extract_height(&r, &FixedHeaders).await,
            Err(HeightError::UnparseableHeight(_))
        ));
    }

    #[tokio::test]
    async fn test_extract_height_not_height_bearing() {
        let r = req("eth_getTransactionByHash", vec![json!("0xabc")]);
        assert!(matches!(
            extract_height(&r, &FixedHeaders).await,
            Err(HeightError::NotHeightBearing(_))
        ));
    }

    #[test]
    fn test_tip_tags() {
        assert!(HeightReference::LATEST.is_tip());
        assert!(HeightReference::EMPTY.is_tip());
        assert!(!HeightReference::EARLIEST.is_tip());
        assert!(!HeightReference(5).is_tip());
        assert!(HeightReference(5).is_concrete_positive());
        assert!(!HeightReference(0).is_concrete_positive());
    }
}
