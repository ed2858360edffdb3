use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cache::{CacheError, CacheStore, CacheTtl};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-process cache store. Expired entries are dropped when next read.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: CacheTtl) -> Result<(), CacheError> {
        let expires_at = match ttl {
            CacheTtl::Indefinite => None,
            CacheTtl::Finite(d) => Some(Instant::now() + d),
        };
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn entries(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CacheError> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.is_live(now))
            .map(|e| (e.key().clone(), e.value.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
