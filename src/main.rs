// Cross-exchange arbitrage monitor
// Main entry point

use anyhow::{Context, Result};
use cexarb_monitor::arbitrage::{DetectorConfig, FeeSchedule, OpportunityDetector};
use cexarb_monitor::config::load_config;
use cexarb_monitor::manager::BotManager;
use cexarb_monitor::storage::{BookCache, ConfigStore, OpportunitySink};
use cexarb_monitor::symbols::SymbolRegistry;
use cexarb_monitor::types::VenueId;
use cexarb_monitor::venues;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let process = load_config();
    info!("cross-exchange arbitrage monitor starting");

    // Startup failures here are the only fatal ones; everything after
    // surfaces as events and log lines
    let store = ConfigStore::connect(&process.redis_url)
        .await
        .context("cannot reach the config store")?;
    let cache = BookCache::new(store.connection());
    let sink = Arc::new(
        OpportunitySink::open(&process.database_path)
            .context("cannot open the opportunity database")?,
    );

    let mut registry = SymbolRegistry::new();
    if process.discover_pairs {
        seed_registry(&mut registry).await;
    }
    let registry = Arc::new(registry);

    let detector = OpportunityDetector::new(
        DetectorConfig::default(),
        FeeSchedule::default(),
        registry.clone(),
        sink.clone(),
    );
    let manager = BotManager::new(store, cache, registry, detector);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    manager.run(shutdown_rx).await?;
    info!("monitor stopped");
    Ok(())
}

/// Seed the symbol registry from venue discovery endpoints. Failures are
/// non-fatal; the registry falls back to its formatting recipes.
async fn seed_registry(registry: &mut SymbolRegistry) {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    match venues::binance::fetch_trading_pairs(&http).await {
        Ok(pairs) => {
            info!(pairs = pairs.len(), "registered binance pair list");
            registry.register_pairs(VenueId::Binance, &pairs);
        }
        Err(e) => warn!(error = %e, "binance pair discovery failed"),
    }
    match venues::coinbase::fetch_trading_pairs(&http).await {
        Ok(pairs) => {
            info!(pairs = pairs.len(), "registered coinbase pair list");
            registry.register_pairs(VenueId::Coinbase, &pairs);
        }
        Err(e) => warn!(error = %e, "coinbase pair discovery failed"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
