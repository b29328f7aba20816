//! Rate limiting and recency-tracked caching.
//!
//! [`rate_limit::TokenBucketLimiter`] admits or rejects work per key under
//! several simultaneous windows. [`cache::RecencyCache`] stores values in a
//! [`store::KeyedStore`] and evicts the least recently used keys on demand.
//! Both take their time from an injectable [`clock::Clock`].

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod metrics;
pub mod rate_limit;
pub mod state;
pub mod store;

pub use cache::{CacheConfig, CacheStats, RecencyCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CacheError, ConfigError, StoreError};
pub use rate_limit::{LimiterConfig, Operation, TierConfig, TokenBucketLimiter};
pub use store::{KeyedStore, MemoryStore};
