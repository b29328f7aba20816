//! Bounded key/value cache with least-recently-used eviction.
//!
//! Values live in a `KeyedStore` under `lru:<key>` with an absolute TTL.
//! Recency is tracked in the `lru_keys` sorted set, scored by the time of
//! the last `put` or `get`, so the oldest or newest keys come back from a
//! range query instead of a scan. Size is a soft cap: nothing is evicted
//! until `evict_excess` runs.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{CacheError, ConfigError, StoreError};
use crate::metrics::{CACHE_EVICTIONS, CACHE_HITS, CACHE_MISSES, CACHE_SIZE};
use crate::store::KeyedStore;

pub const VALUE_PREFIX: &str = "lru:";
pub const INDEX_SET: &str = "lru_keys";

const LOCK_STRIPES: usize = 64;

pub fn value_key(key: &str) -> String {
    format!("{}{}", VALUE_PREFIX, key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Absolute lifetime of a value, counted from its last `put`.
    pub entry_ttl: Duration,
    /// Target size for `evict_to_capacity`.
    pub max_size: usize,
    /// Upper bound on each store call. `None` waits forever.
    pub op_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(10 * 60),
            max_size: 100,
            op_timeout: Some(Duration::from_millis(500)),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entry_ttl.is_zero() {
            return Err(ConfigError::ZeroTtl);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_keys: usize,
    /// Least recently used first.
    pub keys: Vec<String>,
}

pub struct RecencyCache {
    store: Arc<dyn KeyedStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    origin: Instant,
    // Striped per-key locks: same-key operations serialize, others rarely meet
    locks: Vec<Mutex<()>>,
}

impl RecencyCache {
    pub fn new(
        store: Arc<dyn KeyedStore>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let origin = clock.now();
        Ok(Self {
            store,
            clock,
            config,
            origin,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store `value` and mark `key` as most recently used.
    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<(), CacheError> {
        let _guard = self.lock_for(key).lock().await;
        // index first: an index entry without a value heals on the next
        // get or purge, a value without an index entry never would
        self.bounded("put", key, self.store.zadd(INDEX_SET, key, self.score_now()))
            .await?;
        self.bounded(
            "put",
            key,
            self.store
                .set(&value_key(key), value.into(), Some(self.config.entry_ttl)),
        )
        .await?;

        debug!(key = %key, "Cache PUT");
        Ok(())
    }

    /// Read `key`, refreshing its recency on a hit.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let _guard = self.lock_for(key).lock().await;

        match self.bounded("get", key, self.store.get(&value_key(key))).await? {
            Some(value) => {
                self.bounded("get", key, self.store.zadd(INDEX_SET, key, self.score_now()))
                    .await?;
                CACHE_HITS.inc();
                debug!(key = %key, "Cache HIT");
                Ok(Some(value))
            }
            None => {
                // the value may have expired under us; drop its index entry
                self.bounded("get", key, self.store.zremove(INDEX_SET, key))
                    .await?;
                CACHE_MISSES.inc();
                debug!(key = %key, "Cache MISS");
                Ok(None)
            }
        }
    }

    /// Remove `key` and its index entry. Returns whether a value was present;
    /// evicting an absent key is not an error.
    pub async fn evict(&self, key: &str) -> Result<bool, CacheError> {
        let _guard = self.lock_for(key).lock().await;
        self.evict_locked(key).await
    }

    pub async fn least_recently_used(&self, n: usize) -> Result<Vec<String>, CacheError> {
        let Some(end) = last_rank(n) else {
            return Ok(Vec::new());
        };
        self.bounded("least_recently_used", INDEX_SET, self.store.zrange(INDEX_SET, 0, end))
            .await
    }

    pub async fn most_recently_used(&self, n: usize) -> Result<Vec<String>, CacheError> {
        let Some(end) = last_rank(n) else {
            return Ok(Vec::new());
        };
        self.bounded(
            "most_recently_used",
            INDEX_SET,
            self.store.zrevrange(INDEX_SET, 0, end),
        )
        .await
    }

    /// Evict least recently used keys until at most `max_size` remain.
    ///
    /// Candidates are picked from one snapshot of the index, then removed one
    /// key at a time. A key put after the snapshot may survive this pass.
    pub async fn evict_excess(&self, max_size: usize) -> Result<usize, CacheError> {
        let total = self
            .bounded("evict_excess", INDEX_SET, self.store.zcard(INDEX_SET))
            .await?;
        if total <= max_size {
            return Ok(0);
        }

        let excess = total - max_size;
        info!(
            size = total,
            max_size = max_size,
            evicting = excess,
            "Cache exceeds max size, evicting least recently used keys"
        );

        let candidates = self.least_recently_used(excess).await?;
        let mut evicted = 0;
        for key in &candidates {
            let _guard = self.lock_for(key).lock().await;
            self.evict_locked(key).await?;
            evicted += 1;
        }
        CACHE_EVICTIONS.inc_by(evicted as f64);
        CACHE_SIZE.set(total.saturating_sub(evicted) as f64);
        Ok(evicted)
    }

    pub async fn evict_to_capacity(&self) -> Result<usize, CacheError> {
        self.evict_excess(self.config.max_size).await
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let keys = self
            .bounded("stats", INDEX_SET, self.store.zrange(INDEX_SET, 0, -1))
            .await?;
        CACHE_SIZE.set(keys.len() as f64);
        Ok(CacheStats {
            total_keys: keys.len(),
            keys,
        })
    }

    /// Evict every key currently indexed. Returns how many were removed.
    pub async fn clear_all(&self) -> Result<usize, CacheError> {
        info!("Clearing all LRU cache data");
        let keys = self
            .bounded("clear_all", INDEX_SET, self.store.zrange(INDEX_SET, 0, -1))
            .await?;
        for key in &keys {
            let _guard = self.lock_for(key).lock().await;
            self.evict_locked(key).await?;
        }
        CACHE_SIZE.set(0.0);
        Ok(keys.len())
    }

    /// Drop index entries whose value has expired out of the store.
    pub async fn purge_expired(&self) -> Result<usize, CacheError> {
        let keys = self
            .bounded("purge_expired", INDEX_SET, self.store.zrange(INDEX_SET, 0, -1))
            .await?;
        let mut purged = 0;
        for key in &keys {
            let _guard = self.lock_for(key).lock().await;
            let value = self
                .bounded("purge_expired", key, self.store.get(&value_key(key)))
                .await?;
            if value.is_none()
                && self
                    .bounded("purge_expired", key, self.store.zremove(INDEX_SET, key))
                    .await?
            {
                purged += 1;
            }
        }
        if purged > 0 {
            debug!(purged = purged, "Removed index entries of expired values");
        }
        Ok(purged)
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.put(key, bytes).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| CacheError::Decode {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Cache-aside lookup: return the cached value, or run `loader`, cache
    /// its result and return it. Loader errors are passed through and
    /// nothing is cached.
    pub async fn get_or_insert_with<T, E, F, Fut>(&self, key: &str, loader: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get_json(key).await? {
            return Ok(cached);
        }
        let value = loader().await?;
        self.put_json(key, &value).await?;
        Ok(value)
    }

    async fn evict_locked(&self, key: &str) -> Result<bool, CacheError> {
        let existed = self
            .bounded("evict", key, self.store.delete(&value_key(key)))
            .await?;
        let indexed = self
            .bounded("evict", key, self.store.zremove(INDEX_SET, key))
            .await?;
        if existed || indexed {
            debug!(key = %key, "Evicted key from LRU cache");
        }
        Ok(existed)
    }

    // Microseconds since the cache was created
    fn score_now(&self) -> u64 {
        let elapsed = self.clock.now().saturating_duration_since(self.origin);
        u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
    }

    fn lock_for(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % self.locks.len()]
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        key: &str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, CacheError> {
        let result = match self.config.op_timeout {
            Some(after) => match tokio::time::timeout(after, fut).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout { after }),
            },
            None => fut.await,
        };
        result.map_err(|source| CacheError::Store {
            op,
            key: key.to_string(),
            source,
        })
    }
}

// Inclusive end rank for the first `n` members
fn last_rank(n: usize) -> Option<isize> {
    if n == 0 {
        return None;
    }
    Some(isize::try_from(n - 1).unwrap_or(isize::MAX))
}
