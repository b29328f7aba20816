//! Admission behaviour of the multi-tier token bucket limiter
//!
//! Time is driven by a `ManualClock` so refill boundaries are exact.

use std::sync::Arc;
use std::time::Duration;

use ratekeeper::{LimiterConfig, ManualClock, TierConfig, TokenBucketLimiter};

fn limiter(config: LimiterConfig) -> (Arc<ManualClock>, TokenBucketLimiter) {
    let clock = Arc::new(ManualClock::new());
    let limiter = TokenBucketLimiter::new(config, clock.clone()).unwrap();
    (clock, limiter)
}

#[test]
fn single_tier_conserves_tokens_across_periods() {
    let capacity = 4;
    let (clock, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(capacity)]));

    for _ in 0..capacity {
        assert!(limiter.allow("key", 1));
    }
    assert!(!limiter.allow("key", 1));

    clock.advance(Duration::from_secs(60));
    for _ in 0..capacity {
        assert!(limiter.allow("key", 1));
    }
    assert!(!limiter.allow("key", 1));
}

#[test]
fn exhausted_minute_tier_leaves_hour_tier_untouched() {
    let (_, limiter) = limiter(LimiterConfig::per_minute_and_hour(2, 100));

    assert!(limiter.allow("key", 1));
    assert!(limiter.allow("key", 1));
    assert!(!limiter.allow("key", 1));

    let tiers = limiter.tier_snapshot("key").unwrap();
    assert_eq!(tiers[0].available(), 0);
    assert_eq!(tiers[1].available(), 98);
}

#[test]
fn hour_tier_keeps_limiting_after_minute_refill() {
    let (clock, limiter) = limiter(LimiterConfig::per_minute_and_hour(5, 7));

    for _ in 0..5 {
        assert!(limiter.allow("key", 1));
    }
    clock.advance(Duration::from_secs(60));
    assert!(limiter.allow("key", 1));
    assert!(limiter.allow("key", 1));
    assert!(!limiter.allow("key", 1));
    assert_eq!(limiter.available_tokens("key"), 0);

    // only the hour window is holding us back now
    let wait = limiter.time_to_next_token("key");
    assert_eq!(wait, Duration::from_secs(3600 - 60));
}

#[test]
fn five_per_minute_scenario() {
    let (clock, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(5)]));

    for _ in 0..5 {
        assert!(limiter.allow("user1", 1));
    }
    assert!(!limiter.allow("user1", 1));

    let wait = limiter.time_to_next_token("user1");
    assert!(wait > Duration::ZERO);
    assert!(wait <= Duration::from_secs(60));

    clock.advance(Duration::from_secs(20));
    assert_eq!(limiter.time_to_next_token("user1"), Duration::from_secs(40));
}

#[test]
fn interval_refill_permits_burst_at_window_boundary() {
    let (clock, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(3)]));

    assert!(limiter.allow("key", 1));
    clock.advance(Duration::from_secs(59));
    assert!(limiter.allow("key", 1));
    assert!(limiter.allow("key", 1));

    // one second later the whole window comes back at once
    clock.advance(Duration::from_secs(1));
    for _ in 0..3 {
        assert!(limiter.allow("key", 1));
    }
    assert!(!limiter.allow("key", 1));
}

#[test]
fn keys_are_limited_independently() {
    let (_, limiter) = limiter(LimiterConfig::new(vec![TierConfig::per_minute(1)]));
    assert!(limiter.allow("a", 1));
    assert!(!limiter.allow("a", 1));
    assert!(limiter.allow("b", 1));
    assert_eq!(limiter.bucket_count(), 2);
}

#[test]
fn independent_limiters_do_not_share_state() {
    let clock = Arc::new(ManualClock::new());
    let config = LimiterConfig::new(vec![TierConfig::per_minute(1)]);
    let first = TokenBucketLimiter::new(config.clone(), clock.clone()).unwrap();
    let second = TokenBucketLimiter::new(config, clock).unwrap();

    assert!(first.allow("key", 1));
    assert!(!first.allow("key", 1));
    assert!(second.allow("key", 1));
}

#[test]
fn concurrent_multi_tier_consumption_is_all_or_nothing() {
    let (_, limiter) = limiter(LimiterConfig::per_minute_and_hour(30, 1000));

    std::thread::scope(|s| {
        for _ in 0..6 {
            s.spawn(|| {
                for _ in 0..20 {
                    limiter.allow("shared", 1);
                }
            });
        }
    });

    let tiers = limiter.tier_snapshot("shared").unwrap();
    assert_eq!(tiers[0].available(), 0);
    assert_eq!(tiers[1].available(), 970);
}
