use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, TextEncoder, register_counter, register_gauge};


lazy_static! {
    pub static ref LIMITER_ADMITTED: Counter =
        register_counter!("ratekeeper_limiter_admitted_total", "Requests admitted by the rate limiter").unwrap();
    pub static ref LIMITER_REJECTED: Counter =
        register_counter!("ratekeeper_limiter_rejected_total", "Requests rejected by the rate limiter").unwrap();
    pub static ref LIMITER_KEYS: Gauge =
        register_gauge!("ratekeeper_limiter_keys", "Keys with live rate limit buckets").unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("ratekeeper_cache_hits_total", "Total cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("ratekeeper_cache_misses_total", "Total cache misses").unwrap();
    pub static ref CACHE_EVICTIONS: Counter =
        register_counter!("ratekeeper_cache_evictions_total", "Keys evicted from the recency cache").unwrap();
    pub static ref CACHE_SIZE: Gauge =
        register_gauge!("ratekeeper_cache_size", "Current number of items in cache").unwrap();
}

// Text exposition of everything in the default registry
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
