//! In-memory entity cache
//!
//! Process-wide store for entities (keyed by ULID) and named entity
//! lists (keyed by string), each with its own absolute expiration.
//! Uses Moka for high-performance concurrent caching.

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use ulid::Ulid;

use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, CACHE_SIZE};

// =============================================================================
// Keys and entries
// =============================================================================

/// Cache key
///
/// Single entities and named lists live in separate namespaces, so an id
/// and a list key with the same textual form never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Entity(Ulid),
    List(String),
}

impl CacheKey {
    fn kind(&self) -> &'static str {
        match self {
            CacheKey::Entity(_) => "entity",
            CacheKey::List(_) => "list",
        }
    }
}

/// Type-erased cached value with its time-to-live
#[derive(Clone)]
struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    ttl: Duration,
}

/// Absolute expiration: every write restarts the clock with the entry's own TTL,
/// reads never extend it.
struct AbsoluteExpiry;

impl Expiry<CacheKey, CacheEntry> for AbsoluteExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

// =============================================================================
// Cache contract
// =============================================================================

/// Backend-neutral entity cache
///
/// Lookups never fail: a missing, expired, removed or differently-typed
/// entry is reported as `None`.
#[async_trait]
pub trait EntityCache: Send + Sync {
    /// Get a single entity by id
    async fn get<T>(&self, id: Ulid) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static;

    /// Get a named list; an empty cached list is a hit
    async fn get_list<T>(&self, key: &str) -> Option<Arc<Vec<T>>>
    where
        T: Send + Sync + 'static;

    /// Store an entity, expiring `ttl` from now
    async fn set<T>(&self, id: Ulid, entity: T, ttl: Duration)
    where
        T: Send + Sync + 'static;

    /// Store a named list, expiring `ttl` from now
    async fn set_list<T>(&self, key: &str, entities: Vec<T>, ttl: Duration)
    where
        T: Send + Sync + 'static;

    /// Evict an entity (no-op if absent)
    async fn remove(&self, id: Ulid);

    /// Evict a named list (no-op if absent)
    async fn remove_list(&self, key: &str);
}

// =============================================================================
// Memory cache
// =============================================================================

/// Moka-backed entity cache
///
/// Thread-safe and cheap to share behind an `Arc`. Writes to the same key
/// are last-write-wins; there is no cross-key atomicity.
pub struct MemoryCache {
    entries: Cache<CacheKey, CacheEntry>,
}

impl MemoryCache {
    /// Create new entity cache
    ///
    /// # Arguments
    /// * `max_capacity` - Maximum number of entries before eviction
    pub fn new(max_capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(AbsoluteExpiry)
            .build();

        Self { entries }
    }

    /// Number of live entries (after flushing pending maintenance)
    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    /// Invalidate every entry
    pub async fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        CACHE_SIZE.set(0);
        tracing::debug!("Cleared all entity cache entries");
    }

    async fn lookup<V>(&self, key: CacheKey) -> Option<Arc<V>>
    where
        V: Send + Sync + 'static,
    {
        let kind = key.kind();
        let value = match self.entries.get(&key).await {
            Some(entry) => match entry.value.downcast::<V>() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::debug!(?key, "Cached entry has a different type; treating as miss");
                    None
                }
            },
            None => None,
        };

        if value.is_some() {
            CACHE_HITS_TOTAL.with_label_values(&[kind]).inc();
        } else {
            CACHE_MISSES_TOTAL.with_label_values(&[kind]).inc();
        }

        value
    }

    async fn store(&self, key: CacheKey, value: Arc<dyn Any + Send + Sync>, ttl: Duration) {
        self.entries.insert(key, CacheEntry { value, ttl }).await;
        CACHE_SIZE.set(self.entries.entry_count() as i64);
    }

    async fn evict(&self, key: CacheKey) {
        self.entries.invalidate(&key).await;
        CACHE_SIZE.set(self.entries.entry_count() as i64);
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CACHE_MAX_CAPACITY)
    }
}

#[async_trait]
impl EntityCache for MemoryCache {
    async fn get<T>(&self, id: Ulid) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.lookup::<T>(CacheKey::Entity(id)).await
    }

    async fn get_list<T>(&self, key: &str) -> Option<Arc<Vec<T>>>
    where
        T: Send + Sync + 'static,
    {
        self.lookup::<Vec<T>>(CacheKey::List(key.to_string())).await
    }

    async fn set<T>(&self, id: Ulid, entity: T, ttl: Duration)
    where
        T: Send + Sync + 'static,
    {
        self.store(CacheKey::Entity(id), Arc::new(entity), ttl).await;
    }

    async fn set_list<T>(&self, key: &str, entities: Vec<T>, ttl: Duration)
    where
        T: Send + Sync + 'static,
    {
        self.store(CacheKey::List(key.to_string()), Arc::new(entities), ttl)
            .await;
    }

    async fn remove(&self, id: Ulid) {
        self.evict(CacheKey::Entity(id)).await;
    }

    async fn remove_list(&self, key: &str) {
        self.evict(CacheKey::List(key.to_string())).await;
    }
}
