//! Keyed value store with sorted sets.
//!
//! `KeyedStore` is the narrow slice of a Redis-style server the cache needs:
//! plain values with an optional TTL plus score-ordered sets. `MemoryStore`
//! is the in-process implementation used by the binary and the tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::StoreError;

#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Removes a value or a whole sorted set. Returns whether anything existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Insert or update a member's score.
    async fn zadd(&self, set: &str, member: &str, score: u64) -> Result<(), StoreError>;

    /// Members by ascending score, ties by member. `start`/`end` are inclusive
    /// ranks and may be negative to count from the end (`-1` is the last).
    async fn zrange(&self, set: &str, start: isize, end: isize) -> Result<Vec<String>, StoreError>;

    /// Same as `zrange` but by descending score.
    async fn zrevrange(&self, set: &str, start: isize, end: isize)
    -> Result<Vec<String>, StoreError>;

    async fn zremove(&self, set: &str, member: &str) -> Result<bool, StoreError>;

    async fn zcard(&self, set: &str) -> Result<usize, StoreError>;

    async fn zscore(&self, set: &str, member: &str) -> Result<Option<u64>, StoreError>;
}

struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
struct SortedSet {
    ordered: BTreeSet<(u64, String)>,
    scores: HashMap<String, u64>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: u64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.ordered.remove(&(score, member.to_string())),
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

// Resolve Redis-style inclusive ranks against a set of `len` members
fn resolve_range(len: usize, start: isize, end: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { start + len } else { start }.max(0);
    let end = if end < 0 { end + len } else { end }.min(len - 1);
    if len == 0 || start > end || start >= len {
        return None;
    }
    Some((start as usize, (end - start + 1) as usize))
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    values: DashMap<String, StoredValue>,
    sets: DashMap<String, SortedSet>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            values: DashMap::new(),
            sets: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle a simulated outage. While unavailable every operation fails
    /// with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::Relaxed);
        if was != available {
            if available {
                debug!("Memory store is now available");
            } else {
                warn!("Memory store marked unavailable");
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Drop every value whose TTL has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.values.len();
        self.values.retain(|_, v| !v.is_expired(now));
        before.saturating_sub(self.values.len())
    }

    // Number of live values, expired ones excluded
    pub fn value_count(&self) -> usize {
        let now = self.clock.now();
        self.values.iter().filter(|v| !v.is_expired(now)).count()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: "memory store is offline".to_string(),
            })
        }
    }

    fn range(&self, set: &str, start: isize, end: isize, reverse: bool) -> Vec<String> {
        let Some(sorted) = self.sets.get(set) else {
            return Vec::new();
        };
        let Some((skip, take)) = resolve_range(sorted.len(), start, end) else {
            return Vec::new();
        };
        if reverse {
            sorted
                .ordered
                .iter()
                .rev()
                .skip(skip)
                .take(take)
                .map(|(_, m)| m.clone())
                .collect()
        } else {
            sorted
                .ordered
                .iter()
                .skip(skip)
                .take(take)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.ensure_available()?;
        let expires_at = ttl.map(|ttl| self.clock.now() + ttl);
        self.values.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();
        // lazily drop an expired value so it never reads back
        self.values.remove_if(key, |_, v| v.is_expired(now));
        Ok(self.values.get(key).map(|v| v.bytes.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let value = self.values.remove(key).is_some();
        let set = self.sets.remove(key).is_some();
        Ok(value || set)
    }

    async fn zadd(&self, set: &str, member: &str, score: u64) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.sets
            .entry(set.to_string())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn zrange(&self, set: &str, start: isize, end: isize) -> Result<Vec<String>, StoreError> {
        self.ensure_available()?;
        Ok(self.range(set, start, end, false))
    }

    async fn zrevrange(
        &self,
        set: &str,
        start: isize,
        end: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.ensure_available()?;
        Ok(self.range(set, start, end, true))
    }

    async fn zremove(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let removed = match self.sets.get_mut(set) {
            Some(mut sorted) => sorted.remove(member),
            None => false,
        };
        // empty sets vanish, like in Redis
        self.sets.remove_if(set, |_, s| s.scores.is_empty());
        Ok(removed)
    }

    async fn zcard(&self, set: &str) -> Result<usize, StoreError> {
        self.ensure_available()?;
        Ok(self.sets.get(set).map(|s| s.len()).unwrap_or(0))
    }

    async fn zscore(&self, set: &str, member: &str) -> Result<Option<u64>, StoreError> {
        self.ensure_available()?;
        Ok(self
            .sets
            .get(set)
            .and_then(|s| s.scores.get(member).copied()))
    }
}
