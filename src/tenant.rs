//! Per-tenant cache with a time-to-live.
//!
//! Owned by whoever needs it and passed in explicitly; there is no
//! process-global cache.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    inserted: Instant,
}

/// Values keyed by tenant id, expiring `ttl` after insertion.
pub struct TenantCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    ttl: Duration,
}

impl<V: Clone> TenantCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh value for `tenant`, if any.
    pub async fn get(&self, tenant: &str) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(tenant)
            .filter(|e| e.inserted.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    pub async fn insert(&self, tenant: impl Into<String>, value: V) {
        self.entries.write().await.insert(
            tenant.into(),
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    /// Return the cached value or load, cache, and return a new one.
    /// Load errors are returned as-is and nothing is cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, tenant: &str, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(tenant).await {
            return Ok(value);
        }
        let value = load().await?;
        self.insert(tenant, value.clone()).await;
        Ok(value)
    }

    pub async fn invalidate(&self, tenant: &str) -> bool {
        self.entries.write().await.remove(tenant).is_some()
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.inserted.elapsed() < self.ttl);
        before - entries.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
