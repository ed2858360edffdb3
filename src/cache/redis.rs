use anyhow::Result;
use async_trait::async_trait;
use fred::prelude::*;
use fred::types::Key;
use futures_util::TryStreamExt;
use tracing::debug;

use crate::cache::{CacheError, CacheStore, CacheTtl};

/// Cache store backed by a Fred Redis pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub async fn new(url: &str, pool_size: usize) -> Result<Self> {
        let config = Config::from_url(url)?;
        let pool = Builder::from_config(config)
            .set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2))
            .build_pool(pool_size)?;

        pool.init().await?;
        debug!(url = %url, pool_size, "redis pool connected");

        Ok(Self { pool })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.pool.get::<Option<Vec<u8>>, _>(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: CacheTtl) -> Result<(), CacheError> {
        let expiry = match ttl {
            CacheTtl::Indefinite => None,
            CacheTtl::Finite(d) => Some(Expiration::PX(d.as_millis() as i64)),
        };
        self.pool
            .set::<(), _, _>(key, value.to_vec(), expiry, None, false)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.pool.del::<(), _>(key).await?;
        Ok(())
    }

    async fn entries(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CacheError> {
        let pattern = format!("{prefix}*");
        let keys: Vec<Key> = self
            .pool
            .next()
            .scan_buffered(pattern, Some(100), None)
            .try_collect()
            .await?;

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(name) = key.as_str().map(str::to_string) else {
                continue;
            };
            if let Some(value) = self.get(&name).await? {
                out.push((name, value));
            }
        }
        Ok(out)
    }
}
