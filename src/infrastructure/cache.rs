use crate::domain::ports::{Cache, CacheKey};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Slots {
    entries: HashMap<CacheKey, CacheEntry>,
    generations: HashMap<CacheKey, u64>,
}

impl Slots {
    fn generation(&self, key: &CacheKey) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    fn insert(&mut self, key: CacheKey, value: serde_json::Value, ttl: Duration, capacity: usize) {
        let now = Instant::now();
        if !self.entries.contains_key(&key) && self.entries.len() >= capacity {
            self.entries.retain(|_, e| e.expires_at > now);
            if self.entries.len() >= capacity
                && let Some(victim) = self
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone())
            {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }
}

/// A process-local, time-bounded cache of entity snapshots.
///
/// Expired entries are dropped lazily on read. When `capacity` is reached the
/// insert first purges expired entries, then evicts the entry closest to expiry.
/// Each key also carries an invalidation generation, so a snapshot loaded
/// before a commit cannot be stored after that commit invalidated the key.
#[derive(Clone)]
pub struct TtlCache {
    slots: Arc<RwLock<Slots>>,
    capacity: usize,
}

impl TtlCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(RwLock::new(Slots::default())),
            capacity: capacity.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.entries.is_empty()
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl Cache for TtlCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<serde_json::Value>> {
        let now = Instant::now();
        {
            let slots = self.slots.read().await;
            match slots.entries.get(key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        let mut slots = self.slots.write().await;
        if slots.entries.get(key).is_some_and(|e| e.expires_at <= now) {
            slots.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: CacheKey, value: serde_json::Value, ttl: Duration) -> Result<()> {
        self.slots.write().await.insert(key, value, ttl, self.capacity);
        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        let mut slots = self.slots.write().await;
        slots.entries.remove(key);
        *slots.generations.entry(key.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn generation(&self, key: &CacheKey) -> Result<u64> {
        Ok(self.slots.read().await.generation(key))
    }

    async fn set_if_current(
        &self,
        key: CacheKey,
        value: serde_json::Value,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool> {
        let mut slots = self.slots.write().await;
        if slots.generation(&key) != generation {
            return Ok(false);
        }
        slots.insert(key, value, ttl, self.capacity);
        Ok(true)
    }
}
