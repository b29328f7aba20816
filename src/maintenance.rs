use std::sync::Arc;
use tokio::time::{Duration, interval};
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::metrics::LIMITER_KEYS;
use crate::state::AppState;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_values: usize,
    pub stale_index_entries: usize,
    pub evicted: usize,
    pub cache_size: usize,
}

/// One maintenance pass: drop expired values, reconcile the recency index,
/// then trim the cache back to its configured size.
pub async fn sweep(state: &AppState) -> Result<SweepReport, CacheError> {
    let expired_values = state.store.purge_expired();
    let stale_index_entries = state.cache.purge_expired().await?;
    let evicted = state.cache.evict_to_capacity().await?;
    let cache_size = state.cache.stats().await?.total_keys;
    LIMITER_KEYS.set(state.limiter.bucket_count() as f64);

    Ok(SweepReport {
        expired_values,
        stale_index_entries,
        evicted,
        cache_size,
    })
}

// Periodic sweeper - the limiter and cache never run timers themselves

pub async fn run(state: Arc<AppState>, every: Duration) {
    let mut interval = interval(every);

    info!("Maintenance sweeper started (interval: {:?})", every);

    loop {
        interval.tick().await;

        match sweep(&state).await {
            Ok(report) if report.evicted > 0 || report.stale_index_entries > 0 => {
                info!(
                    evicted = report.evicted,
                    stale = report.stale_index_entries,
                    expired = report.expired_values,
                    size = report.cache_size,
                    "Cache sweep finished"
                );
            }
            Ok(report) => debug!(size = report.cache_size, "Cache sweep found nothing to do"),
            // store outages are retried on the next tick
            Err(e) => warn!(error = %e, "Cache sweep failed"),
        }
    }
}
