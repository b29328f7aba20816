use std::time::Duration;
use thiserror::Error;

/// Invalid limiter or cache settings, detected at construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one rate tier is required when limiting is enabled")]
    NoTiers,

    #[error("tier {tier} has zero capacity")]
    ZeroCapacity { tier: usize },

    #[error("tier {tier} has a zero refill period")]
    ZeroPeriod { tier: usize },

    #[error("premium multiplier must be at least 1")]
    ZeroMultiplier,

    #[error("cache entry TTL must be non-zero")]
    ZeroTtl,
}

/// Failures of the backing key/value store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("store did not respond within {after:?}")]
    Timeout { after: Duration },
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("{op} failed for key {key}: {source}")]
    Store {
        op: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to encode value for key {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode value for key {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    // True when the store could not be reached (outage or timeout)
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::Store { .. })
    }

    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            CacheError::Store { source, .. } => Some(source),
            _ => None,
        }
    }
}
