//! Dynamic manager.
//!
//! Owns the venue-client set, mediates configuration, and publishes status.
//! All venue events funnel through one bounded channel into a single
//! consumer here, which makes the detector's book map single-writer: per
//! book update the manager writes the cache entry, feeds the detector, and
//! re-emits the event to local subscribers.
//!
//! Config is only ever applied from the `bot:config:update` subscription.
//! Admin changes go through the store and come back on the topic.

use crate::arbitrage::OpportunityDetector;
use crate::storage::{BookCache, ConfigStore, StoreError};
use crate::symbols::SymbolRegistry;
use crate::types::{now_ms, ArbitrageOpportunity, BotConfig, BotStatus, OrderBook, VenueId};
use crate::venues::{build_client, VenueClient, VenueEvent, EVENT_CHANNEL_CAPACITY};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

/// Status refresh cadence.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Grace period for draining queued intake work at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Events re-emitted to local subscribers (API layer, tests).
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Book(OrderBook),
    Opportunity(ArbitrageOpportunity),
    VenueConnected(VenueId),
    VenueDisconnected(VenueId),
    VenueError {
        venue: VenueId,
        detail: String,
        terminal: bool,
    },
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct BotManager {
    store: ConfigStore,
    cache: BookCache,
    registry: Arc<SymbolRegistry>,
    detector: OpportunityDetector,
    clients: BTreeMap<VenueId, Arc<dyn VenueClient>>,
    connected: BTreeSet<VenueId>,
    config: BotConfig,
    started_at: i64,
    events_tx: mpsc::Sender<VenueEvent>,
    events_rx: mpsc::Receiver<VenueEvent>,
    broadcast: broadcast::Sender<MonitorEvent>,
}

impl BotManager {
    pub fn new(
        store: ConfigStore,
        cache: BookCache,
        registry: Arc<SymbolRegistry>,
        detector: OpportunityDetector,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (broadcast, _) = broadcast::channel(256);
        Self {
            store,
            cache,
            registry,
            detector,
            clients: BTreeMap::new(),
            connected: BTreeSet::new(),
            config: BotConfig::default(),
            started_at: now_ms(),
            events_tx,
            events_rx,
            broadcast,
        }
    }

    /// Subscribe to re-emitted monitor events.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.broadcast.subscribe()
    }

    /// Run until `shutdown` flips. Consumes the manager.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ManagerError> {
        // Subscribe before the initial read so no update can slip between
        let mut config_rx = self.store.subscribe_config().await?;

        self.config = match self.store.read_config().await? {
            Some(config) => config,
            None => {
                info!("no stored config, using defaults");
                BotConfig::default()
            }
        };
        self.started_at = now_ms();

        if self.config.is_active {
            self.start_clients().await;
        } else {
            info!("config is inactive, starting without venue clients");
        }
        self.write_status(true).await;
        info!(venues = self.clients.len(), "monitor running");

        let mut status_timer = tokio::time::interval(STATUS_INTERVAL);
        status_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|s| *s) => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                update = config_rx.recv() => match update {
                    Some(config) => self.apply_config(config).await,
                    None => {
                        warn!("config subscription closed, keeping current config");
                        // Recreate the subscriber; if the store is gone this
                        // keeps failing and the process runs on stale config
                        match self.store.subscribe_config().await {
                            Ok(rx) => config_rx = rx,
                            Err(e) => {
                                warn!(error = %e, "could not resubscribe to config updates");
                                tokio::time::sleep(Duration::from_secs(5)).await;
                            }
                        }
                    }
                },
                _ = status_timer.tick() => self.write_status(true).await,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Idempotent teardown: stop clients, drain briefly, final status.
    async fn shutdown(&mut self) {
        info!("shutting down");
        self.stop_clients().await;

        // Bounded grace for intake that was already queued
        let drain = async {
            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_event(event).await;
            }
        };
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, drain).await;

        self.connected.clear();
        self.write_status(false).await;
        let _ = self.broadcast.send(MonitorEvent::Stopped);
    }

    /// Resolve native symbols per enabled venue, build the clients, and
    /// connect them concurrently.
    async fn start_clients(&mut self) {
        let venues: Vec<VenueId> = dedup_venues(&self.config.venues);
        let symbols = clamp_symbols(&self.registry, &venues, &self.config.canonical_symbols);

        for venue in venues {
            let natives: Vec<String> = symbols
                .iter()
                .filter_map(|s| self.registry.to_native(s, venue))
                .collect();
            if natives.is_empty() {
                warn!(venue = %venue, "no resolvable symbols, skipping client");
                continue;
            }
            let client = build_client(venue, natives, self.events_tx.clone());
            self.clients.insert(venue, client);
        }

        let connects = self.clients.values().map(|c| c.connect());
        for (venue, result) in self.clients.keys().zip(join_all(connects).await) {
            if let Err(e) = result {
                warn!(venue = %venue, error = %e, "client failed to launch");
            }
        }
    }

    async fn stop_clients(&mut self) {
        let clients: Vec<Arc<dyn VenueClient>> = self.clients.values().cloned().collect();
        join_all(clients.iter().map(|c| c.disconnect())).await;
        self.clients.clear();
        self.connected.clear();
    }

    /// One intake action per book event: cache write, detector feed,
    /// local re-emit.
    async fn handle_event(&mut self, event: VenueEvent) {
        match event {
            VenueEvent::Book(book) => {
                if let Err(e) = self.cache.put(&book).await {
                    warn!(venue = %book.venue, symbol = %book.symbol, error = %e, "cache write failed");
                }
                let opportunities = self.detector.on_book(book.clone()).await;
                let _ = self.broadcast.send(MonitorEvent::Book(book));
                for opp in opportunities {
                    let _ = self.broadcast.send(MonitorEvent::Opportunity(opp));
                }
            }
            VenueEvent::Connected(venue) => {
                self.connected.insert(venue);
                let _ = self.broadcast.send(MonitorEvent::VenueConnected(venue));
            }
            VenueEvent::Disconnected(venue) => {
                self.connected.remove(&venue);
                let _ = self.broadcast.send(MonitorEvent::VenueDisconnected(venue));
            }
            VenueEvent::Error {
                venue,
                detail,
                terminal,
            } => {
                if terminal {
                    warn!(venue = %venue, detail, "client went terminal");
                    self.connected.remove(&venue);
                } else {
                    warn!(venue = %venue, detail, "venue error");
                }
                let _ = self.broadcast.send(MonitorEvent::VenueError {
                    venue,
                    detail,
                    terminal,
                });
            }
        }
    }

    /// Apply a config received from the subscription. Tunables always
    /// follow; the client set rebuilds only when venues, symbols, or the
    /// active flag changed.
    async fn apply_config(&mut self, new: BotConfig) {
        if new.venues.is_empty() {
            warn!("rejecting config update with empty venue set");
            return;
        }

        self.detector
            .set_tunables(new.min_profit_percent, new.trade_amount_usd);

        let was_active = !self.clients.is_empty();
        let reshape = needs_restart(&self.config, &new) || new.is_active != was_active;
        self.config = new;

        if reshape {
            info!(
                venues = ?self.config.venues,
                symbols = ?self.config.canonical_symbols,
                active = self.config.is_active,
                "reshaping venue clients"
            );
            self.stop_clients().await;
            self.detector.reset();
            if self.config.is_active {
                self.start_clients().await;
            }
        }
        self.write_status(true).await;
    }

    async fn write_status(&self, running: bool) {
        let status = BotStatus {
            is_running: running,
            connected_venues: self.connected.iter().copied().collect(),
            uptime_started_at: self.started_at,
            config: self.config.clone(),
        };
        if let Err(e) = self.store.write_status(&status).await {
            warn!(error = %e, "status write failed");
        }
    }
}

fn dedup_venues(venues: &[VenueId]) -> Vec<VenueId> {
    let mut seen = HashSet::new();
    venues
        .iter()
        .copied()
        .filter(|v| seen.insert(*v))
        .collect()
}

/// Keep only canonical symbols every enabled venue can spell natively.
fn clamp_symbols(
    registry: &SymbolRegistry,
    venues: &[VenueId],
    canonical_symbols: &[String],
) -> Vec<String> {
    canonical_symbols
        .iter()
        .filter(|symbol| {
            let supported = venues
                .iter()
                .all(|&venue| registry.to_native(symbol, venue).is_some());
            if !supported {
                warn!(symbol = %symbol, "symbol unsupported by current venue set, dropping");
            }
            supported
        })
        .cloned()
        .collect()
}

/// Venue or symbol set changed, order-insensitive.
fn needs_restart(old: &BotConfig, new: &BotConfig) -> bool {
    let old_venues: BTreeSet<_> = old.venues.iter().collect();
    let new_venues: BTreeSet<_> = new.venues.iter().collect();
    if old_venues != new_venues {
        return true;
    }
    let old_symbols: BTreeSet<_> = old.canonical_symbols.iter().collect();
    let new_symbols: BTreeSet<_> = new.canonical_symbols.iter().collect();
    old_symbols != new_symbols
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradingPair;

    fn config(venues: Vec<VenueId>, symbols: Vec<&str>) -> BotConfig {
        BotConfig {
            venues,
            canonical_symbols: symbols.into_iter().map(String::from).collect(),
            ..BotConfig::default()
        }
    }

    #[test]
    fn test_needs_restart_is_order_insensitive() {
        let a = config(
            vec![VenueId::Binance, VenueId::Coinbase],
            vec!["BTCUSD", "ETHUSD"],
        );
        let b = config(
            vec![VenueId::Coinbase, VenueId::Binance],
            vec!["ETHUSD", "BTCUSD"],
        );
        assert!(!needs_restart(&a, &b));
    }

    #[test]
    fn test_needs_restart_on_venue_change() {
        let a = config(vec![VenueId::Binance, VenueId::Coinbase], vec!["BTCUSD"]);
        let b = config(
            vec![VenueId::Binance, VenueId::Coinbase, VenueId::Kraken],
            vec!["BTCUSD"],
        );
        assert!(needs_restart(&a, &b));
    }

    #[test]
    fn test_needs_restart_ignores_tunables() {
        let a = config(vec![VenueId::Binance, VenueId::Coinbase], vec!["BTCUSD"]);
        let mut b = a.clone();
        b.min_profit_percent = 0.5;
        b.trade_amount_usd = 5_000.0;
        assert!(!needs_restart(&a, &b));
    }

    #[test]
    fn test_clamp_symbols_drops_unsupported() {
        let mut registry = SymbolRegistry::new();
        registry.register_pairs(
            VenueId::Gemini,
            &[TradingPair {
                native_symbol: "btcusd".to_string(),
                base_asset: "BTC".to_string(),
                quote_asset: "USD".to_string(),
                canonical_symbol: "BTCUSD".to_string(),
                active: true,
                min_order_size: None,
                tick_size: None,
            }],
        );
        let venues = [VenueId::Binance, VenueId::Gemini];
        let symbols = vec!["BTCUSD".to_string(), "ETHUSD".to_string()];
        // Gemini's registered pair list lacks ETHUSD
        assert_eq!(clamp_symbols(&registry, &venues, &symbols), vec!["BTCUSD"]);
    }

    #[test]
    fn test_dedup_venues_keeps_first_occurrence() {
        let venues = vec![VenueId::Kraken, VenueId::Binance, VenueId::Kraken];
        assert_eq!(
            dedup_venues(&venues),
            vec![VenueId::Kraken, VenueId::Binance]
        );
    }
}
