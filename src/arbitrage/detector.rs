//! Opportunity Detector
//!
//! Consumes order-book updates from the manager intake path and, on a
//! throttled tick, scans every canonical symbol with at least two fresh
//! books for two-leg opportunities. Each venue pair is evaluated in both
//! directions; a direction qualifies when the net profit after taker fees
//! clears `min_profit_percent + slippage_buffer`.
//!
//! The book map is single-writer: only the manager's intake task calls
//! `on_book`, so no lock is needed around it.

use crate::arbitrage::fees::FeeSchedule;
use crate::storage::OpportunitySink;
use crate::symbols::SymbolRegistry;
use crate::types::{now_ms, ArbitrageOpportunity, OrderBook, VenueId};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Detector tunables. `min_profit_percent` and `trade_amount_usd` follow
/// the live config; the rest are process constants in practice.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Net profit threshold in percent of trade value.
    pub min_profit_percent: f64,
    /// Extra qualification margin in percent, absorbing expected slippage.
    pub slippage_buffer: f64,
    /// Books older than this are invisible to the scan.
    pub max_spread_age_ms: i64,
    /// Minimum gap between scans.
    pub tick_interval_ms: u64,
    /// USD notional used for the quantity model.
    pub trade_amount_usd: f64,
    /// Rolling bound on persisted opportunities.
    pub retention_count: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_profit_percent: 0.1,
            slippage_buffer: 0.1,
            max_spread_age_ms: 5_000,
            tick_interval_ms: 1_000,
            trade_amount_usd: 1_000.0,
            retention_count: 1_000,
        }
    }
}

pub struct OpportunityDetector {
    config: DetectorConfig,
    fees: FeeSchedule,
    registry: Arc<SymbolRegistry>,
    sink: Arc<OpportunitySink>,
    /// Latest book per (venue, native symbol), fed by the intake path.
    books: HashMap<(VenueId, String), OrderBook>,
    last_tick: Option<Instant>,
}

impl OpportunityDetector {
    pub fn new(
        config: DetectorConfig,
        fees: FeeSchedule,
        registry: Arc<SymbolRegistry>,
        sink: Arc<OpportunitySink>,
    ) -> Self {
        Self {
            config,
            fees,
            registry,
            sink,
            books: HashMap::new(),
            last_tick: None,
        }
    }

    /// Follow the live config without restarting the detector.
    pub fn set_tunables(&mut self, min_profit_percent: f64, trade_amount_usd: f64) {
        self.config.min_profit_percent = min_profit_percent;
        self.config.trade_amount_usd = trade_amount_usd;
    }

    /// Drop all cached books, e.g. when the venue set is rebuilt.
    pub fn reset(&mut self) {
        self.books.clear();
    }

    /// Intake one book update. Runs a scan at most once per tick interval
    /// and returns the opportunities it emitted.
    pub async fn on_book(&mut self, book: OrderBook) -> Vec<ArbitrageOpportunity> {
        self.books.insert((book.venue, book.symbol.clone()), book);

        let now = Instant::now();
        if let Some(last) = self.last_tick {
            if now.duration_since(last) < Duration::from_millis(self.config.tick_interval_ms) {
                return Vec::new();
            }
        }
        self.last_tick = Some(now);
        self.scan().await
    }

    /// Evaluate every canonical symbol with >= 2 fresh books. Scan order is
    /// deterministic: symbols ascending, venue pairs by (min, max) venue,
    /// then the A->B direction before B->A.
    async fn scan(&self) -> Vec<ArbitrageOpportunity> {
        let now = now_ms();

        let mut by_canonical: BTreeMap<String, Vec<&OrderBook>> = BTreeMap::new();
        for ((venue, native), book) in &self.books {
            let Some(canonical) = self.registry.canonicalize(*venue, native) else {
                continue;
            };
            if book.age_ms(now) > self.config.max_spread_age_ms {
                continue;
            }
            by_canonical.entry(canonical).or_default().push(book);
        }

        let mut emitted = Vec::new();
        for (canonical, mut books) in by_canonical {
            if books.len() < 2 {
                continue;
            }
            books.sort_by_key(|b| b.venue);
            for i in 0..books.len() {
                for j in (i + 1)..books.len() {
                    for (buy, sell) in [(books[i], books[j]), (books[j], books[i])] {
                        if let Some(opp) = self.evaluate(&canonical, buy, sell, now) {
                            emitted.push(opp);
                        }
                    }
                }
            }
        }

        for opp in &emitted {
            self.persist(opp).await;
        }
        emitted
    }

    /// One direction: buy at `buy.asks[0]`, sell at `sell.bids[0]`, sized
    /// as `trade_amount_usd / buy_price` of base.
    fn evaluate(
        &self,
        canonical: &str,
        buy: &OrderBook,
        sell: &OrderBook,
        now: i64,
    ) -> Option<ArbitrageOpportunity> {
        let ask = buy.best_ask()?;
        let bid = sell.best_bid()?;
        let buy_price = ask.price_f64();
        let sell_price = bid.price_f64();
        if buy_price <= 0.0 {
            return None;
        }

        let qty = self.config.trade_amount_usd / buy_price;
        let buy_value = self.config.trade_amount_usd;
        let sell_value = sell_price * qty;

        let buy_fee = buy_value * self.fees.taker(buy.venue);
        let sell_fee = sell_value * self.fees.taker(sell.venue);
        let total_fee = buy_fee + sell_fee;

        let gross = sell_value - buy_value;
        let net = gross - total_fee;
        let profit_percent = (net / buy_value) * 100.0;

        if profit_percent < self.config.min_profit_percent + self.config.slippage_buffer {
            return None;
        }

        info!(
            "🎯 OPPORTUNITY: {} | Buy {} @ {:.6} | Sell {} @ {:.6} | Net ${:.2} ({:.3}%)",
            canonical, buy.venue, buy_price, sell.venue, sell_price, net, profit_percent
        );

        Some(ArbitrageOpportunity {
            id: new_opportunity_id(now),
            canonical_symbol: canonical.to_string(),
            buy_venue: buy.venue,
            sell_venue: sell.venue,
            buy_price,
            sell_price,
            gross_spread: gross,
            spread_percent: (gross / buy_value) * 100.0,
            estimated_net_profit: net,
            buy_fee,
            sell_fee,
            total_fee,
            detected_at: now,
        })
    }

    /// Persist with rolling retention. Failures never suppress the
    /// in-process emission; the sink retries venue-constraint misses itself.
    async fn persist(&self, opp: &ArbitrageOpportunity) {
        if let Err(e) = self.sink.append(opp).await {
            warn!(id = %opp.id, error = %e, "failed to persist opportunity");
            return;
        }
        match self.sink.prune_to(self.config.retention_count).await {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "trimmed opportunity retention"),
            Err(e) => warn!(error = %e, "retention prune failed"),
        }
    }
}

fn new_opportunity_id(now: i64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("opp_{}_{}", now, suffix.to_ascii_lowercase())
}
