use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::invalidation::{Invalidator, ResourceTag};

/// How a read may be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Always go to the backend.
    #[default]
    NoStore,
    /// Serve a stored copy younger than the given age.
    Revalidate(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: String,
    token: Option<String>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    tags: BTreeSet<ResourceTag>,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) < self.ttl
    }
}

#[derive(Default)]
struct Store {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Epoch at which each tag was last invalidated.
    invalidated: HashMap<ResourceTag, u64>,
}

/// Read-through store for backend GET responses, keyed per caller.
#[derive(Clone, Default)]
pub struct ResponseCache {
    store: Arc<RwLock<Store>>,
    clock: Arc<AtomicU64>,
    revisions: Arc<RwLock<HashMap<String, u64>>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Option<Value> {
        let key = CacheKey { path: path.to_string(), token: token.map(str::to_string) };
        let store = self.store.read().await;
        let entry = store.entries.get(&key)?;
        entry.is_fresh(Instant::now()).then(|| entry.value.clone())
    }

    /// Invalidation epoch. Take it before fetching a value that will be
    /// handed to [`put_observed`](Self::put_observed).
    pub fn epoch(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub async fn put(&self, path: &str, token: Option<&str>, value: Value, tags: &[ResourceTag], ttl: Duration) -> bool {
        self.put_observed(self.epoch(), path, token, value, tags, ttl).await
    }

    /// Stores `value` unless one of its tags was invalidated after `observed`,
    /// i.e. while the value was being fetched. Returns whether it was stored.
    pub async fn put_observed(
        &self,
        observed: u64,
        path: &str,
        token: Option<&str>,
        value: Value,
        tags: &[ResourceTag],
        ttl: Duration,
    ) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let mut store = self.store.write().await;
        if tags.iter().any(|t| store.invalidated.get(t).is_some_and(|e| *e > observed)) {
            return false;
        }
        let key = CacheKey { path: path.to_string(), token: token.map(str::to_string) };
        let entry = CacheEntry { value, tags: tags.iter().cloned().collect(), stored_at: Instant::now(), ttl };
        let now = Instant::now();
        store.entries.retain(|_, e| e.is_fresh(now));
        store.entries.insert(key, entry);
        true
    }

    /// Drops every entry subscribed to any of `tags`; returns how many went.
    pub async fn evict_tags(&self, tags: &BTreeSet<ResourceTag>) -> usize {
        let mut store = self.store.write().await;
        let epoch = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        for tag in tags {
            store.invalidated.insert(tag.clone(), epoch);
        }
        let before = store.entries.len();
        store.entries.retain(|_, e| e.tags.is_disjoint(tags));
        before - store.entries.len()
    }

    /// Incremented on every `revalidate_path`; pages compare it to decide
    /// whether what they rendered is stale.
    pub async fn revision(&self, path: &str) -> u64 {
        self.revisions.read().await.get(path).copied().unwrap_or(0)
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }
}

#[async_trait]
impl Invalidator for ResponseCache {
    async fn invalidate_tags(&self, tags: &BTreeSet<ResourceTag>) -> anyhow::Result<()> {
        let evicted = self.evict_tags(tags).await;
        tracing::trace!(evicted, "response cache evicted");
        Ok(())
    }

    async fn revalidate_path(&self, path: &str) -> anyhow::Result<()> {
        *self.revisions.write().await.entry(path.to_string()).or_insert(0) += 1;
        Ok(())
    }
}
