mod api;
mod config;
mod db;
mod detector;
mod error;
mod fetcher;
mod poller;
mod scorer;
mod state;
mod types;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::Latencies;
use crate::api::routes::{router, ApiState};
use crate::config::Config;
use crate::db::{Catalog, PriceStore};
use crate::detector::FusionEngine;
use crate::error::Result;
use crate::poller::FeedPoller;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = db::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    let prices = PriceStore::new(pool.clone(), cfg.signals.noise_floor);
    let catalog = Catalog::new(pool);
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(Latencies::new()?);

    info!(
        feed = %cfg.feed_url,
        interval_secs = cfg.poll_interval_secs,
        window_start = %cfg.active_window.start,
        window_end = %cfg.active_window.end,
        utc_offset = %cfg.tz,
        "Feed poller configured"
    );

    // Feed poller (background, every POLL_INTERVAL_SECS)
    let poller = FeedPoller::new(
        cfg.clone(),
        prices.clone(),
        catalog.clone(),
        Arc::clone(&health),
        Arc::clone(&latency),
    )?;
    tokio::spawn(async move { poller.run().await });

    // HTTP API server
    let engine = FusionEngine::new(prices.clone(), catalog, cfg.signals.clone(), cfg.tz);
    let app = router(ApiState { engine, prices, health, latency });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
