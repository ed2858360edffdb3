use std::time::Duration;

use anyhow::Result;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tracing::{debug, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

pub fn init_metrics() -> Result<()> {
    // Idempotent: skip if already initialized (safe for tests)
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new();
    let handle = match builder.install_recorder() {
        Ok(h) => h,
        Err(_) => return Ok(()), // Global recorder already set
    };
    let _ = PROMETHEUS_HANDLE.set(handle);

    metrics::describe_counter!("sluice_requests_total", "Total proxied JSON-RPC requests");
    metrics::describe_counter!("sluice_cache_hits_total", "Requests served from cache");
    metrics::describe_counter!("sluice_cache_misses_total", "Requests dispatched to a backend");
    metrics::describe_counter!(
        "sluice_metrics_dropped_total",
        "Request records dropped because the metrics queue was full"
    );
    metrics::describe_histogram!(
        "sluice_request_duration_seconds",
        "End-to-end request duration in seconds"
    );
    metrics::describe_histogram!(
        "sluice_backend_request_duration_seconds",
        "Backend request duration in seconds"
    );
    metrics::describe_histogram!("sluice_batch_size", "Number of entries per batch request");
    metrics::describe_histogram!(
        "sluice_request_block_height",
        "Concrete block height requested, per host"
    );

    Ok(())
}

pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics not initialized".to_string(),
        ),
    }
}

/// One completed proxied request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub method: String,
    pub host: String,
    pub latency: Duration,
    pub cache_hit: bool,
    /// Logical backend name, `None` when served from cache or unroutable.
    pub backend: Option<String>,
    pub status: u16,
    pub block_height: Option<i64>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub origin: Option<String>,
    pub in_batch: bool,
}

/// Client metadata taken from request headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientMetadata {
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub origin: Option<String>,
}

impl ClientMetadata {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            client_ip: get("x-forwarded-for")
                .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string())),
            user_agent: get("user-agent"),
            referer: get("referer"),
            origin: get("origin"),
        }
    }
}

/// Destination for completed request records. Must not block the caller.
pub trait MetricsSink: Send + Sync {
    fn record(&self, record: RequestRecord);
}

/// Queues records for a background task that feeds the Prometheus recorder.
pub struct PrometheusSink {
    tx: mpsc::Sender<RequestRecord>,
}

impl PrometheusSink {
    /// Create the sink and spawn its consumer. Needs a Tokio runtime.
    pub fn spawn(queue_size: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<RequestRecord>(queue_size.max(1));
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                observe(&record);
            }
            debug!("metrics sink closed");
        });
        Self { tx }
    }
}

impl MetricsSink for PrometheusSink {
    fn record(&self, record: RequestRecord) {
        if let Err(e) = self.tx.try_send(record) {
            metrics::counter!("sluice_metrics_dropped_total").increment(1);
            warn!(error = %e, "dropping request record");
        }
    }
}

fn request_labels(record: &RequestRecord) -> [(&'static str, String); 6] {
    [
        ("host", record.host.clone()),
        ("method", record.method.clone()),
        ("backend", record.backend.clone().unwrap_or_else(|| "none".to_string())),
        ("status", record.status.to_string()),
        ("cache_hit", record.cache_hit.to_string()),
        ("in_batch", record.in_batch.to_string()),
    ]
}

/// Concrete block height worth observing; sentinels and genesis are skipped.
fn observed_height(record: &RequestRecord) -> Option<f64> {
    record.block_height.filter(|h| *h > 0).map(|h| h as f64)
}

fn observe(record: &RequestRecord) {
    metrics::counter!("sluice_requests_total", &request_labels(record)).increment(1);

    if record.cache_hit {
        metrics::counter!("sluice_cache_hits_total", "method" => record.method.clone()).increment(1);
    } else {
        metrics::counter!("sluice_cache_misses_total", "method" => record.method.clone()).increment(1);
    }
    metrics::histogram!("sluice_request_duration_seconds", "method" => record.method.clone())
        .record(record.latency.as_secs_f64());
    if let Some(height) = observed_height(record) {
        metrics::histogram!("sluice_request_block_height", "host" => record.host.clone()).record(height);
    }

    debug!(
        host = %record.host,
        method = %record.method,
        status = record.status,
        cache_hit = record.cache_hit,
        in_batch = record.in_batch,
        block_height = ?record.block_height,
        client_ip = record.client_ip.as_deref().unwrap_or("-"),
        user_agent = record.user_agent.as_deref().unwrap_or("-"),
        referer = record.referer.as_deref().unwrap_or("-"),
        origin = record.origin.as_deref().unwrap_or("-"),
        latency_ms = record.latency.as_millis() as u64,
        "request served"
    );
}

/// Sink that discards everything.
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&self, _record: RequestRecord) {}
}
