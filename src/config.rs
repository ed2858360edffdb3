use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::cache::CacheTtl;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub routing: RoutingConfig,
    #[serde(default)]
    pub header_source: Option<HeaderSourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            metrics: MetricsConfig::default(),
            max_body_size: default_max_body_size(),
            max_batch_size: default_max_batch_size(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
    /// Capacity of the request-record queue feeding the metrics task.
    #[serde(default = "default_metrics_queue")]
    pub queue_size: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_metrics_port(),
            path: default_metrics_path(),
            queue_size: default_metrics_queue(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub backend: CacheBackend,
    #[serde(default)]
    pub redis: RedisConfig,
    /// Host -> cache namespace. Hosts without an entry use their own name.
    #[serde(default)]
    pub prefixes: HashMap<String, String>,
    #[serde(default)]
    pub ttl: TtlConfig,
    /// Backend response headers captured alongside cached results.
    #[serde(default)]
    pub whitelisted_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: CacheBackend::default(),
            redis: RedisConfig::default(),
            prefixes: HashMap::new(),
            ttl: TtlConfig::default(),
            whitelisted_headers: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Cache namespace for a request host.
    pub fn prefix_for_host<'a>(&'a self, host: &'a str) -> &'a str {
        self.prefixes.get(host).map(String::as_str).unwrap_or(host)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
        }
    }
}

/// TTL per method class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TtlConfig {
    #[serde(
        rename = "static",
        default = "default_static_ttl",
        deserialize_with = "deserialize_ttl"
    )]
    pub static_methods: TtlValue,
    #[serde(default = "default_height_ttl", deserialize_with = "deserialize_ttl")]
    pub block_number: TtlValue,
    #[serde(default = "default_height_ttl", deserialize_with = "deserialize_ttl")]
    pub block_hash: TtlValue,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            static_methods: default_static_ttl(),
            block_number: default_height_ttl(),
            block_hash: default_height_ttl(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlValue {
    /// Never cache
    Never,
    /// Cache forever (no expiry)
    Forever,
    /// Cache with specific duration
    Duration(Duration),
}

impl TtlValue {
    /// Store-level TTL, or `None` when the class is not cached at all.
    pub fn as_cache_ttl(self) -> Option<CacheTtl> {
        match self {
            TtlValue::Never => None,
            TtlValue::Forever => Some(CacheTtl::Indefinite),
            TtlValue::Duration(d) => Some(CacheTtl::Finite(d)),
        }
    }
}

impl Serialize for TtlValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TtlValue::Never => serializer.serialize_str("-1"),
            TtlValue::Forever => serializer.serialize_str("0"),
            TtlValue::Duration(d) => serializer.serialize_str(&format!("{}ms", d.as_millis())),
        }
    }
}

fn deserialize_ttl<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<TtlValue, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_ttl(&s).map_err(serde::de::Error::custom)
}

fn parse_ttl(s: &str) -> Result<TtlValue> {
    match s.trim() {
        "-1" | "never" => Ok(TtlValue::Never),
        "0" | "forever" => Ok(TtlValue::Forever),
        other => parse_duration_string(other).map(TtlValue::Duration),
    }
}

fn parse_duration_string(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(rest) = s.strip_suffix("ms") {
        let ms: u64 = rest.trim().parse().context("invalid ms value")?;
        return Ok(Duration::from_millis(ms));
    }
    if let Some(rest) = s.strip_suffix('s') {
        let secs: u64 = rest.trim().parse().context("invalid seconds value")?;
        return Ok(Duration::from_secs(secs));
    }
    if let Some(rest) = s.strip_suffix('m') {
        let mins: u64 = rest.trim().parse().context("invalid minutes value")?;
        return Ok(Duration::from_secs(mins * 60));
    }
    if let Some(rest) = s.strip_suffix('h') {
        let hours: u64 = rest.trim().parse().context("invalid hours value")?;
        return Ok(Duration::from_secs(hours * 3600));
    }
    let secs: u64 = s
        .parse()
        .context("invalid duration format, use e.g. '3s', '250ms', '1h'")?;
    Ok(Duration::from_secs(secs))
}

fn deserialize_duration<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Duration, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_duration_string(&s).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Route by decoded block height (pruning vs default).
    #[serde(default)]
    pub height_based: bool,
    /// Additionally route concrete heights to shard backends.
    #[serde(default)]
    pub sharded: bool,
    /// Host -> archival/default backend URL.
    pub default_backends: HashMap<String, String>,
    /// Host -> pruning backend URL.
    #[serde(default)]
    pub pruning_backends: HashMap<String, String>,
    /// Host -> shard intervals, ascending by `end`.
    #[serde(default)]
    pub shards: HashMap<String, Vec<ShardConfig>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ShardConfig {
    /// Inclusive upper block height served by this shard.
    pub end: u64,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaderSourceConfig {
    pub url: String,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7777
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}
fn default_metrics_queue() -> usize {
    4096
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_pool_size() -> usize {
    16
}
fn default_max_body_size() -> usize {
    1_048_576 // 1MB
}
fn default_max_batch_size() -> usize {
    100
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_static_ttl() -> TtlValue {
    TtlValue::Forever
}
fn default_height_ttl() -> TtlValue {
    TtlValue::Duration(Duration::from_secs(3600))
}

/// Interpolate ${VAR} and ${VAR:-default} patterns in a string with environment variable values.
fn interpolate_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}")?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let expr = &caps[1];
            if let Some((var_name, default_val)) = expr.split_once(":-") {
                std::env::var(var_name)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| default_val.to_string())
            } else {
                std::env::var(expr).unwrap_or_default()
            }
        })
        .to_string())
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let interpolated = interpolate_env_vars(raw)?;
        let config: Config =
            serde_yaml::from_str(&interpolated).with_context(|| "failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let routing = &self.routing;
        anyhow::ensure!(
            !routing.default_backends.is_empty(),
            "at least one default backend must be configured"
        );
        anyhow::ensure!(
            !routing.sharded || routing.height_based,
            "sharded routing requires height_based routing"
        );
        anyhow::ensure!(
            self.server.max_batch_size > 0,
            "max_batch_size must be positive"
        );

        for (host, url) in routing
            .default_backends
            .iter()
            .chain(routing.pruning_backends.iter())
        {
            url::Url::parse(url)
                .with_context(|| format!("invalid backend url '{url}' for host '{host}'"))?;
        }
        for host in routing.pruning_backends.keys() {
            anyhow::ensure!(
                routing.default_backends.contains_key(host),
                "pruning host '{}' has no default backend",
                host
            );
        }
        for (host, shards) in &routing.shards {
            anyhow::ensure!(
                routing.default_backends.contains_key(host),
                "shard host '{}' has no default backend",
                host
            );
            let mut previous_end = 0u64;
            for shard in shards {
                anyhow::ensure!(
                    shard.end > previous_end,
                    "shard ends for host '{}' must be positive and strictly ascending",
                    host
                );
                url::Url::parse(&shard.url).with_context(|| {
                    format!("invalid shard url '{}' for host '{host}'", shard.url)
                })?;
                previous_end = shard.end;
            }
        }
        if let Some(source) = &self.header_source {
            url::Url::parse(&source.url)
                .with_context(|| format!("invalid header source url '{}'", source.url))?;
        }

        Ok(())
    }
}
