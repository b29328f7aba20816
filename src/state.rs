use std::sync::Arc;

use crate::cache::RecencyCache;
use crate::clock::Clock;
use crate::config::Args;
use crate::error::ConfigError;
use crate::rate_limit::TokenBucketLimiter;
use crate::store::MemoryStore;

// Shared services handed to callers and to the maintenance loop

pub struct AppState {
    pub limiter: Arc<TokenBucketLimiter>,
    pub cache: Arc<RecencyCache>,
    pub store: Arc<MemoryStore>,
}

impl AppState {
    pub fn from_args(args: &Args, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let limiter = TokenBucketLimiter::new(args.limiter_config(), Arc::clone(&clock))?;
        let store = Arc::new(MemoryStore::new(Arc::clone(&clock)));
        let cache = RecencyCache::new(store.clone(), clock, args.cache_config())?;

        Ok(Self {
            limiter: Arc::new(limiter),
            cache: Arc::new(cache),
            store,
        })
    }
}
