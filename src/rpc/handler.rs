use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::middleware::{CACHE_STATUS_HEADER, CacheLookup, CacheStatus, CachingMiddleware};
use crate::metrics::{ClientMetadata, MetricsSink, RequestRecord};
use crate::router::ProxyRouter;
use crate::rpc::batch::{BatchProcessor, SingleRequestHandler};
use crate::rpc::context::RequestContext;
use crate::rpc::errors::{ProxyError, json_response};
use crate::rpc::types::{DecodedBody, JsonRpcResponse, decode, truncate_json};
use crate::upstream::Transport;

/// Buffered response produced by the proxy.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn cache_status(&self) -> Option<&str> {
        self.headers
            .get(CACHE_STATUS_HEADER)
            .and_then(|v| v.to_str().ok())
    }
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Decodes, caches, routes and forwards JSON-RPC traffic.
pub struct Proxy {
    router: ProxyRouter,
    cache: CachingMiddleware,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn MetricsSink>,
    batches: BatchProcessor,
}

impl Proxy {
    pub fn new(
        router: ProxyRouter,
        cache: CachingMiddleware,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn MetricsSink>,
        max_batch_size: usize,
    ) -> Self {
        Self {
            router,
            cache,
            transport,
            sink,
            batches: BatchProcessor::new(max_batch_size),
        }
    }

    pub fn router(&self) -> &ProxyRouter {
        &self.router
    }

    /// Entry point for a raw request body.
    pub async fn handle(self: &Arc<Self>, host: String, headers: HeaderMap, body: Bytes) -> ProxyResponse {
        match decode(&body) {
            Ok(DecodedBody::Single(req)) => {
                debug!(
                    host = %host,
                    method = %req.method,
                    id = %req.id,
                    params = %truncate_json(&req.params, 512),
                    "client request"
                );
                self.serve(RequestContext::new(host, headers, body, Some(req)))
                    .await
            }
            Ok(DecodedBody::Batch(entries)) if entries.is_empty() => json_response(
                StatusCode::OK,
                &JsonRpcResponse::error(Value::Null, -32600, "empty batch"),
            ),
            Ok(DecodedBody::Batch(entries)) => {
                let handler: Arc<dyn SingleRequestHandler> = self.clone();
                match self.batches.process(handler, &host, &headers, entries).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(host = %host, error = %e, "rejecting batch");
                        e.to_response(Value::Null)
                    }
                }
            }
            Err(e) => {
                // Forwarded as-is to the host's default backend.
                debug!(host = %host, error = %e, "request body not decoded");
                self.serve(RequestContext::new(host, headers, body, None))
                    .await
            }
        }
    }

    /// Single-request path: lookup, dispatch on miss, populate, record.
    pub async fn serve(&self, mut ctx: RequestContext) -> ProxyResponse {
        self.cache.is_cached(&mut ctx).await;

        if let Some(resp) = self.serve_from_cache(&ctx) {
            self.record(&ctx, &resp, None);
            return resp;
        }
        if matches!(ctx.cache, CacheLookup::Hit { .. }) {
            // Unservable entry; fall through as a miss without repopulating.
            ctx.cache = CacheLookup::Skipped;
        }

        let id = request_id(&ctx);
        let Some(target) = self
            .router
            .proxy_for_request(&ctx.host, ctx.envelope.as_ref())
            .cloned()
        else {
            warn!(host = %ctx.host, "no backend configured for host");
            let resp = ProxyError::RoutingNotFound(ctx.host.clone()).to_response(id);
            self.record(&ctx, &resp, None);
            return resp;
        };

        let resp = match self
            .transport
            .forward(&target, &ctx.headers, ctx.body.clone())
            .await
        {
            Ok(reply) => {
                self.cache.caching(&ctx, &reply).await;
                let mut headers = reply.headers;
                headers.insert(CACHE_STATUS_HEADER, CacheStatus::Miss.header_value());
                ProxyResponse {
                    status: reply.status,
                    headers,
                    body: reply.body,
                }
            }
            Err(e) => {
                warn!(host = %ctx.host, backend = %target.name, error = %e, "backend request failed");
                ProxyError::Transport(e).to_response(id)
            }
        };
        self.record(&ctx, &resp, Some(target.name));
        resp
    }

    fn serve_from_cache(&self, ctx: &RequestContext) -> Option<ProxyResponse> {
        let CacheLookup::Hit { key, query } = &ctx.cache else {
            return None;
        };
        let body = match query.response_body(&request_id(ctx)) {
            Ok(body) => body,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to render cached response");
                return None;
            }
        };

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_STATUS_HEADER, CacheStatus::Hit.header_value());
        query.replay_headers(&mut headers);
        Some(ProxyResponse {
            status: StatusCode::OK,
            headers,
            body,
        })
    }

    fn record(&self, ctx: &RequestContext, resp: &ProxyResponse, backend: Option<String>) {
        let client = ClientMetadata::from_headers(&ctx.headers);
        self.sink.record(RequestRecord {
            method: ctx.method().unwrap_or("unknown").to_string(),
            host: ctx.host.clone(),
            latency: ctx.started.elapsed(),
            cache_hit: matches!(ctx.cache, CacheLookup::Hit { .. }),
            backend,
            status: resp.status.as_u16(),
            block_height: ctx.height.map(|h| h.0),
            client_ip: client.client_ip,
            user_agent: client.user_agent,
            referer: client.referer,
            origin: client.origin,
            in_batch: ctx.in_batch,
        });
    }
}

#[async_trait]
impl SingleRequestHandler for Proxy {
    async fn handle_single(&self, ctx: RequestContext) -> ProxyResponse {
        self.serve(ctx).await
    }
}

fn request_id(ctx: &RequestContext) -> Value {
    ctx.envelope
        .as_ref()
        .map(|r| r.id.clone())
        .unwrap_or(Value::Null)
}

/// Host the request was addressed to: the `Host` header, else the URI authority.
pub fn request_host(headers: &HeaderMap, uri: &Uri) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

pub async fn handle_rpc(
    State(proxy): State<Arc<Proxy>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ProxyResponse {
    let host = request_host(&headers, &uri);
    proxy.handle(host, headers, body).await
}
