//! SERPRadio pricing worker daemon.
//!
//! Runs the ingestion cycle on a schedule (or once with ONE_SHOT=true):
//! fan out batched fare queries to the configured provider, upsert
//! observations, refresh the percentile baselines, and emit price-drop
//! notifications.

use anyhow::{Context, Result};
use dotenv::dotenv;
use serpradio_backend::{models::Config, providers, IngestionWorker, PriceStore};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = Config::from_env().context("configuration error")?;
    info!(
        source = %config.price_source,
        origins = config.origins.len(),
        destinations = config.destinations.len(),
        months_ahead = config.months_ahead,
        one_shot = config.one_shot,
        "starting SERPRadio pricing worker"
    );

    let store = Arc::new(PriceStore::open(&config.database_path)?);
    let provider = providers::build(&config)?;
    info!(provider = provider.identity(), "price source ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let worker = IngestionWorker::new(config, provider, store);
    worker.run(shutdown_rx).await
}
