use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

use crate::rpc::types::{JsonRpcRequest, JsonRpcResponse};
use crate::upstream::{BlockHeader, BlockHeaderSource, HeaderSourceError};

/// Resolves block hashes with `eth_getBlockByHash` against a node.
pub struct RpcHeaderSource {
    url: String,
    client: Client,
}

impl RpcHeaderSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl BlockHeaderSource for RpcHeaderSource {
    async fn header_by_hash(&self, hash: &str) -> Result<Option<BlockHeader>, HeaderSourceError> {
        let req = JsonRpcRequest::new(json!(1), "eth_getBlockByHash", vec![json!(hash), json!(false)]);
        let resp: JsonRpcResponse = self
            .client
            .post(&self.url)
            .json(&req)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = resp.error {
            return Err(HeaderSourceError::Rpc(err.message));
        }
        match resp.result {
            None | Some(Value::Null) => Ok(None),
            Some(block) => parse_header(&block).map(Some),
        }
    }
}

fn parse_header(block: &Value) -> Result<BlockHeader, HeaderSourceError> {
    let number_hex = block["number"]
        .as_str()
        .ok_or_else(|| HeaderSourceError::Malformed("missing number".to_string()))?;
    let number = u64::from_str_radix(number_hex.trim_start_matches("0x"), 16)
        .map_err(|_| HeaderSourceError::Malformed(format!("bad number {number_hex}")))?;
    let hash = block["hash"]
        .as_str()
        .ok_or_else(|| HeaderSourceError::Malformed("missing hash".to_string()))?
        .to_string();
    Ok(BlockHeader { number, hash })
}
