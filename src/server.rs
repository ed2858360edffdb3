use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cache::CacheStore;
use crate::cache::memory::MemoryStore;
use crate::cache::middleware::CachingMiddleware;
use crate::cache::redis::RedisStore;
use crate::config::{CacheBackend, Config};
use crate::metrics::{self as app_metrics, MetricsSink, PrometheusSink};
use crate::router::ProxyRouter;
use crate::rpc::handler::{Proxy, handle_rpc};
use crate::upstream::client::HttpTransport;
use crate::upstream::headers::RpcHeaderSource;
use crate::upstream::{BlockHeaderSource, NoHeaderSource, Transport};

/// Build the proxy with its production collaborators.
pub async fn build_proxy(config: &Config) -> anyhow::Result<Arc<Proxy>> {
    let store: Arc<dyn CacheStore> = match config.cache.backend {
        CacheBackend::Redis if config.cache.enabled => {
            let store =
                RedisStore::new(&config.cache.redis.url, config.cache.redis.pool_size).await?;
            info!(url = %config.cache.redis.url, "redis cache connected");
            Arc::new(store)
        }
        _ => Arc::new(MemoryStore::new()),
    };

    let headers: Arc<dyn BlockHeaderSource> = match &config.header_source {
        Some(source) => Arc::new(RpcHeaderSource::new(
            source.url.clone(),
            config.server.request_timeout,
        )?),
        None => Arc::new(NoHeaderSource),
    };

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.server.request_timeout)?);
    let sink: Arc<dyn MetricsSink> = Arc::new(PrometheusSink::spawn(config.server.metrics.queue_size));
    let router = ProxyRouter::from_config(&config.routing)?;

    Ok(Arc::new(Proxy::new(
        router,
        CachingMiddleware::new(store, headers, config.cache.clone()),
        transport,
        sink,
        config.server.max_batch_size,
    )))
}

/// HTTP surface: health check plus JSON-RPC on every other path.
pub fn app(proxy: Arc<Proxy>, max_body_size: usize) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/", post(handle_rpc))
        .route("/{*path}", post(handle_rpc))
        .with_state(proxy)
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .layer(TraceLayer::new_for_http())
}

pub async fn setup(config: &Config) -> anyhow::Result<Router> {
    app_metrics::init_metrics()?;
    let proxy = build_proxy(config).await?;
    info!(router = proxy.router().kind(), "proxy initialized");
    Ok(app(proxy, config.server.max_body_size))
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let app = setup(&config).await?;

    // Start metrics server on separate port
    let metrics_addr = format!(
        "{}:{}",
        config.server.metrics.address, config.server.metrics.port
    );
    let metrics_router = Router::new().route(
        &config.server.metrics.path,
        get(app_metrics::metrics_handler),
    );

    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&metrics_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %metrics_addr, error = %e, "failed to bind metrics listener");
                return;
            }
        };
        info!(addr = %metrics_addr, "metrics server listening");
        if let Err(e) = axum::serve(listener, metrics_router).await {
            error!(error = %e, "metrics server stopped");
        }
    });

    let addr = format!("{}:{}", config.server.address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "sluice listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
