use clap::Parser; // for cli
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::clock::SystemClock;
use ratekeeper::config::Args;
use ratekeeper::{maintenance, metrics};
use ratekeeper::state::AppState;

// this is main async function with tokio
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // parse cli arguments
    let args = Args::parse();

    let state = match AppState::from_args(&args, Arc::new(SystemClock)) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    if args.rate_limiting_enabled {
        info!(
            "Rate limit: {} requests per minute, {} per hour (premium x{})",
            args.requests_per_minute, args.requests_per_hour, args.premium_multiplier
        );
    } else {
        info!("Rate limiting disabled");
    }
    info!("Cache TTL: {} seconds", args.cache_ttl);
    info!("Cache max size: {} keys", args.cache_max_size);

    // spawn the background sweeper
    let sweeper = tokio::spawn(maintenance::run(Arc::clone(&state), args.sweep_every()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    sweeper.abort();

    match metrics::render() {
        Ok(text) => info!("Final metrics:\n{}", text),
        Err(e) => warn!("Failed to render metrics: {}", e),
    }
    info!("Shutting down");
}
