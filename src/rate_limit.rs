//! Multi-tier token bucket admission control.
//!
//! Each key owns one bucket per configured tier (for example a per-minute and
//! a per-hour window). A request is admitted only if every tier can pay its
//! cost, and then every tier pays; otherwise nothing is consumed.
//!
//! Refill is interval based: once a full period has elapsed since the last
//! refill the bucket jumps straight back to capacity. Idle keys can therefore
//! burst at a window boundary.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::ConfigError;
use crate::metrics::{LIMITER_ADMITTED, LIMITER_REJECTED};

// Key prefix whose buckets use the scaled premium tiers
const PREMIUM_PREFIX: &str = "premium:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierConfig {
    pub capacity: u64,
    pub period: Duration,
}

impl TierConfig {
    pub fn new(capacity: u64, period: Duration) -> Self {
        Self { capacity, period }
    }

    pub fn per_minute(capacity: u64) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    pub fn per_hour(capacity: u64) -> Self {
        Self::new(capacity, Duration::from_secs(60 * 60))
    }

    fn scaled(&self, multiplier: u64) -> Self {
        Self::new(self.capacity.saturating_mul(multiplier), self.period)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    /// When false every request is admitted and no state is kept.
    pub enabled: bool,
    pub tiers: Vec<TierConfig>,
    /// Capacity factor applied to every tier for `premium:` keys.
    pub premium_multiplier: u64,
}

impl LimiterConfig {
    pub fn new(tiers: Vec<TierConfig>) -> Self {
        Self {
            enabled: true,
            tiers,
            premium_multiplier: 5,
        }
    }

    // The usual pair of windows: requests per minute and per hour
    pub fn per_minute_and_hour(per_minute: u64, per_hour: u64) -> Self {
        Self::new(vec![
            TierConfig::per_minute(per_minute),
            TierConfig::per_hour(per_hour),
        ])
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            tiers: Vec::new(),
            premium_multiplier: 5,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.tiers.is_empty() {
            return Err(ConfigError::NoTiers);
        }
        for (tier, t) in self.tiers.iter().enumerate() {
            if t.capacity == 0 {
                return Err(ConfigError::ZeroCapacity { tier });
            }
            if t.period.is_zero() {
                return Err(ConfigError::ZeroPeriod { tier });
            }
        }
        if self.premium_multiplier == 0 {
            return Err(ConfigError::ZeroMultiplier);
        }
        Ok(())
    }
}

/// Token state of one tier for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    capacity: u64,
    period: Duration,
    available: u64,
    last_refill_at: Instant,
}

impl Bucket {
    fn new(tier: TierConfig, now: Instant) -> Self {
        Self {
            capacity: tier.capacity,
            period: tier.period,
            available: tier.capacity,
            last_refill_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_refill_at) >= self.period {
            self.available = self.capacity;
            self.last_refill_at = now;
        }
    }

    fn time_to_refill(&self, now: Instant) -> Duration {
        (self.last_refill_at + self.period).saturating_duration_since(now)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn available(&self) -> u64 {
        self.available
    }

    pub fn last_refill_at(&self) -> Instant {
        self.last_refill_at
    }
}

/// Named request classes, each rate limited under its own key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    UrlCreation,
    UrlAccess,
    Analytics,
    // Consumes one token per item in the batch
    Bulk(u64),
    Premium,
    // Never limited
    Admin,
}

impl Operation {
    pub fn prefix(&self) -> Option<&'static str> {
        match self {
            Operation::UrlCreation => Some("url_creation:"),
            Operation::UrlAccess => Some("url_access:"),
            Operation::Analytics => Some("analytics:"),
            Operation::Bulk(_) => Some("bulk:"),
            Operation::Premium => Some(PREMIUM_PREFIX),
            Operation::Admin => None,
        }
    }

    pub fn key(&self, subject: &str) -> Option<String> {
        self.prefix().map(|p| format!("{}{}", p, subject))
    }

    pub fn cost(&self) -> u64 {
        match self {
            Operation::Bulk(count) => *count,
            _ => 1,
        }
    }
}

type BucketGroup = Arc<Mutex<Vec<Bucket>>>;

pub struct TokenBucketLimiter {
    config: LimiterConfig,
    premium_tiers: Vec<TierConfig>,
    clock: Arc<dyn Clock>,
    buckets: DashMap<String, BucketGroup>,
}

impl TokenBucketLimiter {
    pub fn new(config: LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        let premium_tiers = config
            .tiers
            .iter()
            .map(|t| t.scaled(config.premium_multiplier))
            .collect();

        Ok(Self {
            config,
            premium_tiers,
            clock,
            buckets: DashMap::new(),
        })
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Try to take `cost` tokens from every tier of `key`.
    ///
    /// Returns false without consuming anything when any tier is short.
    /// A cost of zero is charged as one token.
    pub fn allow(&self, key: &str, cost: u64) -> bool {
        if !self.config.enabled {
            return true;
        }
        let cost = cost.max(1);
        let group = self.group(key);
        let now = self.clock.now();

        let admitted = {
            let mut buckets = group.lock();
            for bucket in buckets.iter_mut() {
                bucket.refill(now);
            }
            if buckets.iter().all(|b| b.available >= cost) {
                for bucket in buckets.iter_mut() {
                    bucket.available -= cost;
                }
                true
            } else {
                false
            }
        };

        if admitted {
            LIMITER_ADMITTED.inc();
        } else {
            LIMITER_REJECTED.inc();
            debug!(key = %key, cost = cost, "Rate limit exceeded");
        }
        admitted
    }

    pub fn allow_operation(&self, op: Operation, subject: &str) -> bool {
        match op.key(subject) {
            Some(key) => self.allow(&key, op.cost()),
            None => true,
        }
    }

    /// Fewest tokens left across the tiers of `key`, after any due refill.
    pub fn available_tokens(&self, key: &str) -> u64 {
        if !self.config.enabled {
            return u64::MAX;
        }
        let Some(group) = self.existing_group(key) else {
            return self
                .tiers_for(key)
                .iter()
                .map(|t| t.capacity)
                .min()
                .unwrap_or(0);
        };
        let now = self.clock.now();
        let mut buckets = group.lock();
        buckets
            .iter_mut()
            .map(|b| {
                b.refill(now);
                b.available
            })
            .min()
            .unwrap_or(0)
    }

    /// How long until `key` could be admitted for a single token.
    ///
    /// Zero when a token is available now. Otherwise the longest wait among
    /// the exhausted tiers, since all of them must refill first.
    pub fn time_to_next_token(&self, key: &str) -> Duration {
        if !self.config.enabled {
            return Duration::ZERO;
        }
        let Some(group) = self.existing_group(key) else {
            return Duration::ZERO;
        };
        let now = self.clock.now();
        let mut buckets = group.lock();
        buckets
            .iter_mut()
            .filter_map(|b| {
                b.refill(now);
                (b.available == 0).then(|| b.time_to_refill(now))
            })
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Per-tier bucket state for `key`, in tier order. None if the key was
    /// never seen.
    pub fn tier_snapshot(&self, key: &str) -> Option<Vec<Bucket>> {
        let group = self.existing_group(key)?;
        let now = self.clock.now();
        let mut buckets = group.lock();
        for bucket in buckets.iter_mut() {
            bucket.refill(now);
        }
        Some(buckets.clone())
    }

    pub fn reset(&self, key: &str) {
        if self.buckets.remove(key).is_some() {
            debug!(key = %key, "Cleared rate limit buckets");
        }
    }

    pub fn clear(&self) {
        info!(keys = self.buckets.len(), "Clearing all rate limit buckets");
        self.buckets.clear();
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn tiers_for(&self, key: &str) -> &[TierConfig] {
        if key.starts_with(PREMIUM_PREFIX) {
            &self.premium_tiers
        } else {
            &self.config.tiers
        }
    }

    fn existing_group(&self, key: &str) -> Option<BucketGroup> {
        self.buckets.get(key).map(|g| Arc::clone(g.value()))
    }

    // Fetch or lazily create the buckets of `key`. The map shard is only
    // held for the lookup; consumption happens under the group's own lock.
    fn group(&self, key: &str) -> BucketGroup {
        if let Some(group) = self.existing_group(key) {
            return group;
        }
        let now = self.clock.now();
        let entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, "Creating rate limit buckets");
            let buckets = self
                .tiers_for(key)
                .iter()
                .map(|t| Bucket::new(*t, now))
                .collect();
            Arc::new(Mutex::new(buckets))
        });
        Arc::clone(entry.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(config: LimiterConfig) -> (Arc<ManualClock>, TokenBucketLimiter) {
        let clock = Arc::new(ManualClock::new());
        let limiter = TokenBucketLimiter::new(config, clock.clone()).unwrap();
        (clock, limiter)
    }

    #[test]
    fn rejects_invalid_tiers() {
        let clock = Arc::new(ManualClock::new());

        let zero_cap = LimiterConfig::new(vec![TierConfig::per_minute(0)]);
        assert_eq!(
            TokenBucketLimiter::new(zero_cap, clock.clone()).err(),
            Some(ConfigError::ZeroCapacity { tier: 0 })
        );

        let zero_period = LimiterConfig::new(vec![
            TierConfig::per_minute(5),
            TierConfig::new(10, Duration::ZERO),
        ]);
        assert_eq!(
            TokenBucketLimiter::new(zero_period, clock.clone()).err(),
            Some(ConfigError::ZeroPeriod { tier: 1 })
        );

        assert_eq!(
            TokenBucketLimiter::new(LimiterConfig::new(Vec::new()), clock.clone()).err(),
            Some(ConfigError::NoTiers)
        );

        let mut no_premium = LimiterConfig::per_minute_and_hour(1, 2);
        no_premium.premium_multiplier = 0;
        assert_eq!(
            TokenBucketLimiter::new(no_premium, clock).err(),
            Some(ConfigError::ZeroMultiplier)
        );
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let (_, limiter) = limiter(LimiterConfig::disabled());
        for _ in 0..1000 {
            assert!(limiter.allow("k", 1));
        }
        assert_eq!(limiter.bucket_count(), 0);
        assert_eq!(limiter.available_tokens("k"), u64::MAX);
        assert_eq!(limiter.time_to_next_token("k"), Duration::ZERO);
    }

    #[test]
    fn refill_happens_only_after_full_period() {
        let (clock, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(2)]));
        assert!(limiter.allow("k", 2));
        assert!(!limiter.allow("k", 1));

        clock.advance(Duration::from_secs(59));
        assert!(!limiter.allow("k", 1));
        assert_eq!(limiter.available_tokens("k"), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.available_tokens("k"), 2);
    }

    #[test]
    fn refill_restores_capacity_not_accumulated_periods() {
        let (clock, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(3)]));
        assert!(limiter.allow("k", 1));
        clock.advance(Duration::from_secs(600));
        assert_eq!(limiter.available_tokens("k"), 3);
    }

    #[test]
    fn cost_above_capacity_is_never_admitted() {
        let (_, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(3)]));
        assert!(!limiter.allow("k", 4));
        assert_eq!(limiter.available_tokens("k"), 3);
    }

    #[test]
    fn zero_cost_charges_one_token() {
        let (_, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(2)]));
        assert!(limiter.allow("k", 0));
        assert_eq!(limiter.available_tokens("k"), 1);
    }

    #[test]
    fn unseen_key_reports_full_capacity_without_creating_state() {
        let (_, limiter) = limiter(LimiterConfig::per_minute_and_hour(10, 100));
        assert_eq!(limiter.available_tokens("fresh"), 10);
        assert_eq!(limiter.time_to_next_token("fresh"), Duration::ZERO);
        assert!(limiter.tier_snapshot("fresh").is_none());
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn time_to_next_token_waits_for_slowest_exhausted_tier() {
        let (clock, limiter) = limiter(LimiterConfig::per_minute_and_hour(2, 2));
        assert!(limiter.allow("k", 2));
        clock.advance(Duration::from_secs(10));

        // both tiers are empty, the hour tier refills last
        assert_eq!(
            limiter.time_to_next_token("k"),
            Duration::from_secs(3600 - 10)
        );
    }

    #[test]
    fn time_to_next_token_is_zero_while_tokens_remain() {
        let (_, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(2)]));
        assert!(limiter.allow("k", 1));
        assert_eq!(limiter.time_to_next_token("k"), Duration::ZERO);
    }

    #[test]
    fn reset_forgets_a_single_key() {
        let (_, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(1)]));
        assert!(limiter.allow("a", 1));
        assert!(limiter.allow("b", 1));
        assert!(!limiter.allow("a", 1));

        limiter.reset("a");
        assert!(limiter.allow("a", 1));
        assert!(!limiter.allow("b", 1));

        limiter.clear();
        assert_eq!(limiter.bucket_count(), 0);
        assert!(limiter.allow("b", 1));
    }

    #[test]
    fn operations_use_separate_prefixed_keys() {
        let (_, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(1)]));
        assert!(limiter.allow_operation(Operation::UrlCreation, "alice"));
        assert!(!limiter.allow_operation(Operation::UrlCreation, "alice"));
        assert!(limiter.allow_operation(Operation::Analytics, "alice"));
        assert!(limiter.tier_snapshot("url_creation:alice").is_some());
        assert!(limiter.tier_snapshot("analytics:alice").is_some());
    }

    #[test]
    fn bulk_operations_charge_per_item() {
        let (_, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(10)]));
        assert!(limiter.allow_operation(Operation::Bulk(7), "bob"));
        assert!(!limiter.allow_operation(Operation::Bulk(4), "bob"));
        assert_eq!(limiter.available_tokens("bulk:bob"), 3);
    }

    #[test]
    fn premium_keys_get_scaled_capacity() {
        let (_, limiter) = limiter(LimiterConfig::per_minute_and_hour(2, 20));
        for _ in 0..10 {
            assert!(limiter.allow_operation(Operation::Premium, "carol"));
        }
        assert!(!limiter.allow_operation(Operation::Premium, "carol"));

        let tiers = limiter.tier_snapshot("premium:carol").unwrap();
        assert_eq!(tiers[0].capacity(), 10);
        assert_eq!(tiers[1].capacity(), 100);
        assert_eq!(tiers[1].available(), 90);
    }

    #[test]
    fn admin_operations_bypass_state() {
        let (_, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(1)]));
        for _ in 0..5 {
            assert!(limiter.allow_operation(Operation::Admin, "root"));
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn concurrent_callers_never_overdraw() {
        let (_, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(50)]));
        let admitted = std::sync::atomic::AtomicU64::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..100 {
                        if limiter.allow("shared", 1) {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.into_inner(), 50);
        assert_eq!(limiter.available_tokens("shared"), 0);
    }
}
