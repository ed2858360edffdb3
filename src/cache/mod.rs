pub mod keys;
pub mod memory;
pub mod middleware;
pub mod policy;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Expiry policy for a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    Finite(Duration),
    /// Stored without expiry.
    Indefinite,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] fred::error::Error),
    #[error("cache entry encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Key-value store with per-entry expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: CacheTtl) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// All live entries whose key starts with `prefix`. Diagnostics only.
    async fn entries(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CacheError>;
}
