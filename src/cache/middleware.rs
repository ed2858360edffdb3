//! Check-then-populate caching around backend dispatch.
//!
//! [`CachingMiddleware::is_cached`] runs before dispatch and records the
//! lookup outcome on the request context. [`CachingMiddleware::caching`]
//! runs after dispatch and stores the backend reply when the request missed
//! and both request and response are cacheable. Store failures are logged
//! and treated as a miss or a skipped write.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;
use tracing::{debug, warn};

use crate::cache::keys::{cache_key, chain_prefix};
use crate::cache::policy::{decode_cacheable, is_request_cacheable, ttl_for_method};
use crate::cache::{CacheError, CacheStore, CacheTtl};
use crate::config::CacheConfig;
use crate::rpc::context::RequestContext;
use crate::rpc::height::{block_number_param, extract_height};
use crate::upstream::{BlockHeaderSource, UpstreamReply};

pub const CACHE_STATUS_HEADER: &str = "x-cache-status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Some, but not all, batch entries were served from cache.
    Partial,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Partial => "PARTIAL",
        }
    }

    pub fn header_value(self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

/// Stored form of a cached response. The result keeps the backend's bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedQuery {
    pub result: Box<RawValue>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct CachedEnvelope<'a> {
    jsonrpc: &'static str,
    id: &'a Value,
    result: &'a RawValue,
}

#[derive(Deserialize)]
struct RawResult {
    result: Box<RawValue>,
}

impl CachedQuery {
    /// Response body for a request with the given id.
    pub fn response_body(&self, id: &Value) -> Result<Bytes, serde_json::Error> {
        let envelope = CachedEnvelope {
            jsonrpc: "2.0",
            id,
            result: &self.result,
        };
        serde_json::to_vec(&envelope).map(Bytes::from)
    }

    /// Copy captured headers into `headers` without replacing any already set.
    pub fn replay_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                continue;
            };
            if !headers.contains_key(&name) {
                headers.insert(name, value);
            }
        }
    }
}

/// Outcome of the pre-dispatch lookup.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// Caching disabled, request undecoded or not cacheable.
    Skipped,
    Miss { key: String },
    Hit { key: String, query: CachedQuery },
}

pub struct CachingMiddleware {
    store: Arc<dyn CacheStore>,
    headers: Arc<dyn BlockHeaderSource>,
    config: CacheConfig,
}

impl CachingMiddleware {
    pub fn new(
        store: Arc<dyn CacheStore>,
        headers: Arc<dyn BlockHeaderSource>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            headers,
            config,
        }
    }

    /// Phase one: look the request up and record the outcome on `ctx`.
    pub async fn is_cached(&self, ctx: &mut RequestContext) {
        ctx.cache = CacheLookup::Skipped;
        let Some(req) = ctx.envelope.as_ref() else {
            return;
        };
        if !self.config.enabled {
            ctx.height = block_number_param(req).ok();
            return;
        }

        ctx.height = match extract_height(req, self.headers.as_ref()).await {
            Ok(height) => Some(height),
            Err(e) => {
                debug!(method = %req.method, error = %e, "no block height for request");
                None
            }
        };
        if !is_request_cacheable(&req.method, ctx.height) {
            return;
        }

        let chain = self.config.prefix_for_host(&ctx.host);
        let key = match cache_key(chain, req) {
            Ok(key) => key,
            Err(e) => {
                warn!(method = %req.method, error = %e, "failed to build cache key");
                return;
            }
        };

        ctx.cache = match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_slice::<CachedQuery>(&raw) {
                Ok(query) => {
                    debug!(method = %req.method, key = %key, "cache hit");
                    CacheLookup::Hit { key, query }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "corrupted cache entry, treating as miss");
                    CacheLookup::Miss { key }
                }
            },
            Ok(None) => CacheLookup::Miss { key },
            Err(e) => {
                warn!(key = %key, error = %e, "cache lookup failed, treating as miss");
                CacheLookup::Miss { key }
            }
        };
    }

    /// Phase two: store the backend reply if the request missed and the
    /// reply is cacheable. Returns whether an entry was written.
    pub async fn caching(&self, ctx: &RequestContext, reply: &UpstreamReply) -> bool {
        let CacheLookup::Miss { key } = &ctx.cache else {
            return false;
        };
        let Some(req) = ctx.envelope.as_ref() else {
            return false;
        };
        if !reply.status.is_success() {
            return false;
        }
        let Some(ttl) = ttl_for_method(&self.config.ttl, &req.method) else {
            return false;
        };
        if decode_cacheable(&reply.body, &req.method).is_none() {
            debug!(method = %req.method, "response not cacheable");
            return false;
        }
        let Ok(raw) = serde_json::from_slice::<RawResult>(&reply.body) else {
            return false;
        };

        let query = CachedQuery {
            result: raw.result,
            headers: self.capture_headers(&reply.headers),
        };
        match self.store_query(key, &query, ttl).await {
            Ok(()) => {
                debug!(method = %req.method, key = %key, ttl = ?ttl, "cached response");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache write failed");
                false
            }
        }
    }

    async fn store_query(
        &self,
        key: &str,
        query: &CachedQuery,
        ttl: CacheTtl,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_vec(query)?;
        self.store.set(key, &raw, ttl).await
    }

    fn capture_headers(&self, headers: &HeaderMap) -> BTreeMap<String, String> {
        self.config
            .whitelisted_headers
            .iter()
            .filter_map(|name| {
                let value = headers.get(name.as_str())?.to_str().ok()?;
                Some((name.to_ascii_lowercase(), value.to_string()))
            })
            .collect()
    }

    /// Cached entries for a host's namespace.
    pub async fn entries_for_host(&self, host: &str) -> Result<Vec<(String, CachedQuery)>, CacheError> {
        let prefix = chain_prefix(self.config.prefix_for_host(host));
        let mut out = Vec::new();
        for (key, raw) in self.store.entries(&prefix).await? {
            out.push((key, serde_json::from_slice(&raw)?));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryStore;
    use crate::rpc::types::JsonRpcRequest;
    use crate::config::TtlValue;
    use crate::upstream::{BlockHeader, HeaderSourceError, NoHeaderSource};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    const HOST: &str = "rpc.local";
    const KNOWN_HASH: &str = "0x88e96d4537bea4d9c05d12549907b32561d3bf31f45aae734cdc119f13406cb6";

    fn raw(json: &str) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).unwrap()
    }

    /// Knows the height of exactly one block.
    struct KnownHeaders;

    #[async_trait]
    impl BlockHeaderSource for KnownHeaders {
        async fn header_by_hash(&self, hash: &str) -> Result<Option<BlockHeader>, HeaderSourceError> {
            Ok((hash == KNOWN_HASH).then(|| BlockHeader {
                number: 0x10,
                hash: hash.to_string(),
            }))
        }
    }

    /// Memory store that also remembers the TTL of every write.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        ttls: Mutex<Vec<CacheTtl>>,
    }

    impl RecordingStore {
        fn ttls(&self) -> Vec<CacheTtl> {
            self.ttls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CacheStore for RecordingStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &[u8], ttl: CacheTtl) -> Result<(), CacheError> {
            self.ttls.lock().unwrap().push(ttl);
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.inner.delete(key).await
        }
        async fn entries(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CacheError> {
            self.inner.entries(prefix).await
        }
    }

    struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Encoding(serde_json::from_str::<Value>("x").unwrap_err()))
        }
        async fn set(&self, _key: &str, _value: &[u8], _ttl: CacheTtl) -> Result<(), CacheError> {
            Err(CacheError::Encoding(serde_json::from_str::<Value>("x").unwrap_err()))
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Ok(())
        }
        async fn entries(&self, _prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CacheError> {
            Ok(Vec::new())
        }
    }

    fn config() -> CacheConfig {
        CacheConfig {
            enabled: true,
            whitelisted_headers: vec!["X-Node-Version".to_string()],
            ..Default::default()
        }
    }

    fn middleware(store: Arc<dyn CacheStore>) -> CachingMiddleware {
        CachingMiddleware::new(store, Arc::new(NoHeaderSource), config())
    }

    fn ctx(method: &str, params: Vec<Value>) -> RequestContext {
        let req = JsonRpcRequest::new(json!(1), method, params);
        let body = Bytes::from(serde_json::to_vec(&req).unwrap());
        RequestContext::new(HOST.to_string(), HeaderMap::new(), body, Some(req))
    }

    fn reply(body: Value) -> UpstreamReply {
        let mut headers = HeaderMap::new();
        headers.insert("x-node-version", HeaderValue::from_static("v1"));
        headers.insert("x-other", HeaderValue::from_static("dropped"));
        UpstreamReply {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_miss_then_populate_then_hit() {
        let store = Arc::new(MemoryStore::new());
        let mw = middleware(store.clone());

        let mut first = ctx("eth_getBlockByNumber", vec![json!("0x2"), json!(false)]);
        mw.is_cached(&mut first).await;
        assert!(matches!(first.cache, CacheLookup::Miss { .. }));
        assert!(mw.caching(&first, &reply(json!({"jsonrpc":"2.0","id":1,"result":{"number":"0x2"}}))).await);

        let mut second = ctx("eth_getBlockByNumber", vec![json!("0x2"), json!(false)]);
        mw.is_cached(&mut second).await;
        let CacheLookup::Hit { query, .. } = &second.cache else {
            panic!("expected hit");
        };
        assert_eq!(query.result.get(), r#"{"number":"0x2"}"#);
        assert_eq!(query.headers.get("x-node-version").map(String::as_str), Some("v1"));
        assert!(!query.headers.contains_key("x-other"));
    }

    #[tokio::test]
    async fn test_hit_is_never_repopulated() {
        let store = Arc::new(MemoryStore::new());
        let mw = middleware(store.clone());
        let mut first = ctx("eth_chainId", vec![]);
        mw.is_cached(&mut first).await;
        mw.caching(&first, &reply(json!({"jsonrpc":"2.0","id":1,"result":"0x1"}))).await;

        let mut second = ctx("eth_chainId", vec![]);
        mw.is_cached(&mut second).await;
        assert!(!mw.caching(&second, &reply(json!({"jsonrpc":"2.0","id":1,"result":"0x2"}))).await);
        let entries = mw.entries_for_host(HOST).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.result.get(), r#""0x1""#);
    }

    #[tokio::test]
    async fn test_populate_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mw = middleware(store.clone());
        let body = json!({"jsonrpc":"2.0","id":1,"result":"0x10"});

        let mut a = ctx("eth_getBalance", vec![json!("0xabc"), json!("0x5")]);
        mw.is_cached(&mut a).await;
        let mut b = a.clone();
        b.envelope.as_mut().unwrap().id = json!(2);

        assert!(mw.caching(&a, &reply(body.clone())).await);
        let once = store.entries("").await.unwrap();
        assert!(mw.caching(&b, &reply(body)).await);
        assert_eq!(store.entries("").await.unwrap(), once);
    }

    #[tokio::test]
    async fn test_latest_is_skipped() {
        let mw = middleware(Arc::new(MemoryStore::new()));
        let mut c = ctx("eth_getBlockByNumber", vec![json!("latest"), json!(false)]);
        mw.is_cached(&mut c).await;
        assert!(matches!(c.cache, CacheLookup::Skipped));
        assert!(!mw.caching(&c, &reply(json!({"jsonrpc":"2.0","id":1,"result":{"number":"0x9"}}))).await);
    }

    #[tokio::test]
    async fn test_disabled_cache_skips_but_records_height() {
        let mw = CachingMiddleware::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NoHeaderSource),
            CacheConfig::default(),
        );
        let mut c = ctx("eth_getBlockByNumber", vec![json!("0x2"), json!(false)]);
        mw.is_cached(&mut c).await;
        assert!(matches!(c.cache, CacheLookup::Skipped));
        assert_eq!(c.height.map(|h| h.0), Some(2));
    }

    #[tokio::test]
    async fn test_undecoded_request_skipped() {
        let mw = middleware(Arc::new(MemoryStore::new()));
        let mut c = RequestContext::new(HOST.to_string(), HeaderMap::new(), Bytes::from_static(b"junk"), None);
        mw.is_cached(&mut c).await;
        assert!(matches!(c.cache, CacheLookup::Skipped));
    }

    #[tokio::test]
    async fn test_store_errors_are_soft() {
        let mw = middleware(Arc::new(FailingStore));
        let mut c = ctx("eth_chainId", vec![]);
        mw.is_cached(&mut c).await;
        assert!(matches!(c.cache, CacheLookup::Miss { .. }));
        assert!(!mw.caching(&c, &reply(json!({"jsonrpc":"2.0","id":1,"result":"0x1"}))).await);
    }

    #[tokio::test]
    async fn test_error_reply_not_cached() {
        let mw = middleware(Arc::new(MemoryStore::new()));
        let mut c = ctx("eth_chainId", vec![]);
        mw.is_cached(&mut c).await;
        let body = json!({"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"busy"}});
        assert!(!mw.caching(&c, &reply(body)).await);

        let mut failed = reply(json!({"jsonrpc":"2.0","id":1,"result":"0x1"}));
        failed.status = StatusCode::BAD_GATEWAY;
        assert!(!mw.caching(&c, &failed).await);
    }

    #[test]
    fn test_replay_headers_keeps_existing() {
        let query = CachedQuery {
            result: raw(r#""0x1""#),
            headers: BTreeMap::from([
                ("x-node-version".to_string(), "v1".to_string()),
                ("content-type".to_string(), "text/plain".to_string()),
            ]),
        };
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        query.replay_headers(&mut headers);
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("x-node-version").unwrap(), "v1");
    }

    #[test]
    fn test_response_body_echoes_id() {
        let query = CachedQuery {
            result: raw(r#"{"number":"0x2","hash":"0xabc"}"#),
            headers: BTreeMap::new(),
        };
        assert_eq!(
            &query.response_body(&json!(1)).unwrap()[..],
            br#"{"jsonrpc":"2.0","id":1,"result":{"number":"0x2","hash":"0xabc"}}"#
        );
        assert_eq!(
            &query.response_body(&json!("x")).unwrap()[..],
            br#"{"jsonrpc":"2.0","id":"x","result":{"number":"0x2","hash":"0xabc"}}"#
        );
    }

    #[tokio::test]
    async fn test_result_bytes_survive_store_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let mw = middleware(store.clone());
        let body = br#"{"jsonrpc":"2.0","id":1,"result":{"number":"0x2","hash":"0xabc","transactions":[]}}"#;

        let mut first = ctx("eth_getBlockByNumber", vec![json!("0x2"), json!(false)]);
        mw.is_cached(&mut first).await;
        let upstream = UpstreamReply {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body),
        };
        assert!(mw.caching(&first, &upstream).await);

        let mut second = ctx("eth_getBlockByNumber", vec![json!("0x2"), json!(false)]);
        mw.is_cached(&mut second).await;
        let CacheLookup::Hit { query, .. } = &second.cache else {
            panic!("expected hit");
        };
        assert_eq!(&query.response_body(&json!(1)).unwrap()[..], &body[..]);
    }

    #[tokio::test]
    async fn test_block_hash_resolved_and_cached_with_hash_ttl() {
        let store = Arc::new(RecordingStore::default());
        let mut config = config();
        config.ttl.block_number = TtlValue::Duration(Duration::from_secs(3600));
        config.ttl.block_hash = TtlValue::Duration(Duration::from_secs(60));
        let mw = CachingMiddleware::new(store.clone(), Arc::new(KnownHeaders), config);

        let mut c = ctx("eth_getBlockByHash", vec![json!(KNOWN_HASH), json!(false)]);
        mw.is_cached(&mut c).await;
        assert_eq!(c.height.map(|h| h.0), Some(0x10));
        assert!(matches!(c.cache, CacheLookup::Miss { .. }));
        assert!(mw.caching(&c, &reply(json!({"jsonrpc":"2.0","id":1,"result":{"number":"0x10"}}))).await);
        assert_eq!(
            store.ttls(),
            vec![CacheTtl::Finite(Duration::from_secs(60))]
        );

        let mut unknown = ctx("eth_getBlockByHash", vec![json!("0xdead"), json!(false)]);
        mw.is_cached(&mut unknown).await;
        assert!(unknown.height.is_none());
        assert!(matches!(unknown.cache, CacheLookup::Skipped));
    }
}
