use clap::Parser;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::rate_limit::LimiterConfig;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "ratekeeper")]
#[command(about = "Token bucket rate limiter and LRU cache maintenance daemon")]
pub struct Args {
    // Rate limit: requests allowed per minute per key
    #[arg(long, default_value_t = 10)]
    pub requests_per_minute: u64,

    // Rate limit: requests allowed per hour per key
    #[arg(long, default_value_t = 100)]
    pub requests_per_hour: u64,

    // Turn limiting off entirely (every request admitted)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub rate_limiting_enabled: bool,

    // Capacity factor for premium keys
    #[arg(long, default_value_t = 5)]
    pub premium_multiplier: u64,

    // Cache entry TTL in seconds
    #[arg(short, long, default_value_t = 600)]
    pub cache_ttl: u64,

    // Soft cap on cached keys, enforced by the sweep
    #[arg(long, default_value_t = 100)]
    pub cache_max_size: usize,

    // Per store call timeout in milliseconds (0 disables)
    #[arg(long, default_value_t = 500)]
    pub store_timeout_ms: u64,

    // Maintenance sweep interval in seconds
    #[arg(long, default_value_t = 30)]
    pub sweep_interval: u64,
}

impl Args {
    pub fn limiter_config(&self) -> LimiterConfig {
        let mut config =
            LimiterConfig::per_minute_and_hour(self.requests_per_minute, self.requests_per_hour);
        config.enabled = self.rate_limiting_enabled;
        config.premium_multiplier = self.premium_multiplier;
        config
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            entry_ttl: Duration::from_secs(self.cache_ttl),
            max_size: self.cache_max_size,
            op_timeout: (self.store_timeout_ms > 0)
                .then(|| Duration::from_millis(self.store_timeout_ms)),
        }
    }

    pub fn sweep_every(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_two_tiers() {
        let args = Args::parse_from(["ratekeeper"]);
        let limiter = args.limiter_config();
        assert!(limiter.enabled);
        assert_eq!(limiter.tiers.len(), 2);
        assert_eq!(limiter.tiers[0].capacity, 10);
        assert_eq!(limiter.tiers[0].period, Duration::from_secs(60));
        assert_eq!(limiter.tiers[1].capacity, 100);
        assert_eq!(limiter.tiers[1].period, Duration::from_secs(3600));

        let cache = args.cache_config();
        assert_eq!(cache.entry_ttl, Duration::from_secs(600));
        assert_eq!(cache.op_timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "ratekeeper",
            "--rate-limiting-enabled",
            "false",
            "--store-timeout-ms",
            "0",
            "--cache-max-size",
            "5",
        ]);
        assert!(!args.limiter_config().enabled);
        assert_eq!(args.cache_config().op_timeout, None);
        assert_eq!(args.cache_config().max_size, 5);
    }
}
