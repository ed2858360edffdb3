//! Batch fan-out and merge.
//!
//! Every entry of a batch is replayed through the single-request path on its
//! own task. Sub-responses land in a shared accumulator keyed by position;
//! once all tasks have finished the accumulator is merged into one response.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::middleware::{CACHE_STATUS_HEADER, CacheStatus};
use crate::rpc::context::RequestContext;
use crate::rpc::errors::ProxyError;
use crate::rpc::handler::ProxyResponse;
use crate::rpc::types::{JsonRpcRequest, JsonRpcResponse};

/// Body sent for batch entries that did not decode as a request.
const NULL_BODY: &[u8] = b"null";

/// Serves one request of a batch.
#[async_trait]
pub trait SingleRequestHandler: Send + Sync {
    async fn handle_single(&self, ctx: RequestContext) -> ProxyResponse;
}

/// Outcome of one batch entry.
#[derive(Debug, Clone)]
pub struct BatchSubResponse {
    pub index: usize,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cache_status: CacheStatus,
}

impl BatchSubResponse {
    fn from_response(index: usize, resp: ProxyResponse) -> Self {
        let cache_status = match resp.cache_status() {
            Some("HIT") => CacheStatus::Hit,
            _ => CacheStatus::Miss,
        };
        Self {
            index,
            status: resp.status,
            headers: resp.headers,
            body: resp.body,
            cache_status,
        }
    }
}

#[derive(Default)]
struct BatchAccumulator {
    slots: Vec<Option<BatchSubResponse>>,
    hits: usize,
}

impl BatchAccumulator {
    fn with_len(len: usize) -> Self {
        Self {
            slots: vec![None; len],
            hits: 0,
        }
    }

    fn insert(&mut self, sub: BatchSubResponse) {
        if sub.cache_status == CacheStatus::Hit {
            self.hits += 1;
        }
        let index = sub.index;
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(sub);
        }
    }
}

/// Combined cache status of a batch with `hits` cached entries out of `total`.
pub fn combined_status(hits: usize, total: usize) -> CacheStatus {
    if total == 0 || hits == 0 {
        CacheStatus::Miss
    } else if hits == total {
        CacheStatus::Hit
    } else {
        CacheStatus::Partial
    }
}

pub struct BatchProcessor {
    max_batch_size: usize,
}

impl BatchProcessor {
    pub fn new(max_batch_size: usize) -> Self {
        Self { max_batch_size }
    }

    /// Run every entry concurrently and merge the results in input order.
    pub async fn process(
        &self,
        handler: Arc<dyn SingleRequestHandler>,
        host: &str,
        headers: &HeaderMap,
        entries: Vec<Option<JsonRpcRequest>>,
    ) -> Result<ProxyResponse, ProxyError> {
        let total = entries.len();
        if total > self.max_batch_size {
            return Err(ProxyError::BatchSizeExceeded {
                size: total,
                limit: self.max_batch_size,
            });
        }
        metrics::histogram!("sluice_batch_size").record(total as f64);

        let acc = Arc::new(Mutex::new(BatchAccumulator::with_len(total)));
        let ids: Vec<Value> = entries
            .iter()
            .map(|e| e.as_ref().map(|r| r.id.clone()).unwrap_or(Value::Null))
            .collect();

        let mut tasks = Vec::with_capacity(total);
        for (index, entry) in entries.into_iter().enumerate() {
            let handler = Arc::clone(&handler);
            let acc = Arc::clone(&acc);
            let ctx = sub_request(host, headers, entry);
            tasks.push(tokio::spawn(async move {
                let resp = handler.handle_single(ctx).await;
                let sub = BatchSubResponse::from_response(index, resp);
                if let Ok(mut acc) = acc.lock() {
                    acc.insert(sub);
                }
            }));
        }

        for (index, joined) in join_all(tasks).await.into_iter().enumerate() {
            if let Err(e) = joined {
                warn!(index, error = %e, "batch entry task failed");
            }
        }

        let acc = match acc.lock() {
            Ok(mut acc) => std::mem::take(&mut *acc),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        debug!(host = %host, total, hits = acc.hits, "batch complete");
        Ok(merge(acc, &ids))
    }
}

fn sub_request(host: &str, headers: &HeaderMap, entry: Option<JsonRpcRequest>) -> RequestContext {
    let body = entry
        .as_ref()
        .and_then(|req| serde_json::to_vec(req).ok())
        .map(Bytes::from)
        .unwrap_or_else(|| Bytes::from_static(NULL_BODY));
    let mut ctx = RequestContext::new(host.to_string(), headers.clone(), body, entry);
    ctx.in_batch = true;
    ctx
}

fn merge(acc: BatchAccumulator, ids: &[Value]) -> ProxyResponse {
    let total = acc.slots.len();
    let status = combined_status(acc.hits, total);

    // A failed entry fails the whole batch with its own status and body.
    if let Some(failed) = acc
        .slots
        .iter()
        .flatten()
        .find(|sub| !sub.status.is_success())
    {
        let mut headers = failed.headers.clone();
        headers.remove(header::CONTENT_LENGTH);
        headers.insert(CACHE_STATUS_HEADER, status.header_value());
        return ProxyResponse {
            status: failed.status,
            headers,
            body: failed.body.clone(),
        };
    }

    // Headers come from the first entry by position.
    let mut headers = acc
        .slots
        .first()
        .and_then(|slot| slot.as_ref())
        .map(|sub| sub.headers.clone())
        .unwrap_or_default();
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONTENT_ENCODING);
    headers.remove(CACHE_STATUS_HEADER);
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_STATUS_HEADER, status.header_value());

    let mut body = Vec::with_capacity(2 + acc.slots.iter().flatten().map(|s| s.body.len() + 1).sum::<usize>());
    body.push(b'[');
    for (index, slot) in acc.slots.iter().enumerate() {
        if index > 0 {
            body.push(b',');
        }
        match slot {
            Some(sub) if !sub.body.trim_ascii().is_empty() => body.extend_from_slice(sub.body.trim_ascii()),
            Some(_) => body.extend_from_slice(NULL_BODY),
            None => {
                let id = ids.get(index).cloned().unwrap_or(Value::Null);
                let err = JsonRpcResponse::error(id, -32603, "batch entry failed");
                match serde_json::to_vec(&err) {
                    Ok(raw) => body.extend_from_slice(&raw),
                    Err(_) => body.extend_from_slice(NULL_BODY),
                }
            }
        }
    }
    body.push(b']');

    ProxyResponse {
        status: StatusCode::OK,
        headers,
        body: Bytes::from(body),
    }
}
