// Core data model for the arbitrage monitor.
// Prices and quantities stay as exact decimal strings through the pipeline;
// they are parsed to f64 only at comparison and output time.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current wall-clock time in UTC milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Venues the monitor can stream from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueId {
    Binance,
    Coinbase,
    Kraken,
    Bybit,
    Kucoin,
    Gemini,
}

impl VenueId {
    pub const ALL: [VenueId; 6] = [
        VenueId::Binance,
        VenueId::Coinbase,
        VenueId::Kraken,
        VenueId::Bybit,
        VenueId::Kucoin,
        VenueId::Gemini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueId::Binance => "binance",
            VenueId::Coinbase => "coinbase",
            VenueId::Kraken => "kraken",
            VenueId::Bybit => "bybit",
            VenueId::Kucoin => "kucoin",
            VenueId::Gemini => "gemini",
        }
    }

    /// Maximum depth levels retained per book side for this venue.
    pub fn depth_limit(&self) -> usize {
        match self {
            VenueId::Binance => 100,
            VenueId::Coinbase => 50,
            VenueId::Kraken => 100,
            VenueId::Bybit => 50,
            VenueId::Kucoin => 100,
            VenueId::Gemini => 50,
        }
    }

    /// Public WebSocket endpoint. KuCoin's is discovered at runtime via the
    /// bullet-public handshake, so this is its REST bootstrap URL instead.
    pub fn ws_url(&self) -> &'static str {
        match self {
            VenueId::Binance => "wss://stream.binance.com:9443/ws",
            VenueId::Coinbase => "wss://ws-feed.exchange.coinbase.com",
            VenueId::Kraken => "wss://ws.kraken.com",
            VenueId::Bybit => "wss://stream.bybit.com/v5/public/spot",
            VenueId::Kucoin => "https://api.kucoin.com/api/v1/bullet-public",
            VenueId::Gemini => "wss://api.gemini.com/v1/marketdata",
        }
    }

    /// Public REST base for depth snapshots and pair discovery.
    pub fn rest_url(&self) -> &'static str {
        match self {
            VenueId::Binance => "https://api.binance.com",
            VenueId::Coinbase => "https://api.exchange.coinbase.com",
            VenueId::Kraken => "https://api.kraken.com",
            VenueId::Bybit => "https://api.bybit.com",
            VenueId::Kucoin => "https://api.kucoin.com",
            VenueId::Gemini => "https://api.gemini.com",
        }
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown venue: {0}")]
pub struct UnknownVenue(pub String);

impl FromStr for VenueId {
    type Err = UnknownVenue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(VenueId::Binance),
            "coinbase" => Ok(VenueId::Coinbase),
            "kraken" => Ok(VenueId::Kraken),
            "bybit" => Ok(VenueId::Bybit),
            "kucoin" => Ok(VenueId::Kucoin),
            "gemini" => Ok(VenueId::Gemini),
            other => Err(UnknownVenue(other.to_string())),
        }
    }
}

/// One level of an order book side, venue-precision decimals as strings.
/// Quantity "0" is the wire signal for "remove this level".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: String,
    pub quantity: String,
}

impl PriceLevel {
    pub fn new(price: impl Into<String>, quantity: impl Into<String>) -> Self {
        Self {
            price: price.into(),
            quantity: quantity.into(),
        }
    }

    pub fn price_f64(&self) -> f64 {
        self.price.parse().unwrap_or(0.0)
    }

    pub fn quantity_f64(&self) -> f64 {
        self.quantity.parse().unwrap_or(0.0)
    }
}

/// Locally reconstructed order book for one (venue, native symbol).
///
/// Invariants maintained by the updater in `book`:
/// bids strictly descending by price, asks strictly ascending, each price
/// appears at most once per side, at most `venue.depth_limit()` levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBook {
    pub venue: VenueId,
    /// Venue-native symbol spelling (e.g. "BTC-USD", "XBT/USD").
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// Last update time, UTC milliseconds.
    pub timestamp_ms: i64,
    /// Monotonic update id, for venues that expose one (Binance, Bybit).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_id: Option<u64>,
}

impl OrderBook {
    pub fn new(venue: VenueId, symbol: impl Into<String>) -> Self {
        Self {
            venue,
            symbol: symbol.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp_ms: now_ms(),
            seq_id: None,
        }
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Age relative to `now` in milliseconds. Books stamped in the future
    /// (clock skew) report age 0 and count as fresh.
    pub fn age_ms(&self, now: i64) -> i64 {
        (now - self.timestamp_ms).max(0)
    }
}

/// Static description of a venue: endpoints and default fee schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueDescriptor {
    pub id: VenueId,
    pub display_name: String,
    pub ws_url: String,
    pub rest_url: String,
    /// Fractional taker rate (0.001 = 10 bps).
    pub taker_fee: f64,
    pub maker_fee: f64,
    pub rate_limit_per_min: u32,
}

impl VenueDescriptor {
    /// Built-in descriptor with public endpoints and published spot fees.
    pub fn builtin(id: VenueId) -> Self {
        let (display_name, taker_fee, maker_fee, rate_limit_per_min) = match id {
            VenueId::Binance => ("Binance", 0.001, 0.001, 1200),
            VenueId::Coinbase => ("Coinbase", 0.006, 0.004, 600),
            VenueId::Kraken => ("Kraken", 0.0026, 0.0016, 60),
            VenueId::Bybit => ("Bybit", 0.001, 0.001, 600),
            VenueId::Kucoin => ("KuCoin", 0.001, 0.001, 600),
            VenueId::Gemini => ("Gemini", 0.004, 0.002, 600),
        };
        Self {
            id,
            display_name: display_name.to_string(),
            ws_url: id.ws_url().to_string(),
            rest_url: id.rest_url().to_string(),
            taker_fee,
            maker_fee,
            rate_limit_per_min,
        }
    }
}

/// A tradable pair as a venue reports it in discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPair {
    pub native_symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub canonical_symbol: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_order_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_size: Option<String>,
}

/// Authoritative runtime configuration, stored at `bot:config` and
/// broadcast on `bot:config:update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(rename = "exchanges")]
    pub venues: Vec<VenueId>,
    #[serde(rename = "symbols")]
    pub canonical_symbols: Vec<String>,
    #[serde(rename = "minProfitPercent")]
    pub min_profit_percent: f64,
    #[serde(rename = "tradeAmount")]
    pub trade_amount_usd: f64,
    #[serde(rename = "isActive")]
    pub is_active: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            venues: vec![VenueId::Binance, VenueId::Coinbase],
            canonical_symbols: vec!["BTCUSD".to_string(), "ETHUSD".to_string()],
            min_profit_percent: 0.1,
            trade_amount_usd: 1000.0,
            is_active: true,
        }
    }
}

/// Published at `bot:status` every 10 s while the manager runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStatus {
    #[serde(rename = "isRunning")]
    pub is_running: bool,
    #[serde(rename = "connectedExchanges")]
    pub connected_venues: Vec<VenueId>,
    /// Unix ms the current run started.
    #[serde(rename = "uptime")]
    pub uptime_started_at: i64,
    pub config: BotConfig,
}

/// A qualifying two-leg opportunity: buy on one venue, sell on another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub id: String,
    #[serde(rename = "symbol")]
    pub canonical_symbol: String,
    #[serde(rename = "buyExchange")]
    pub buy_venue: VenueId,
    #[serde(rename = "sellExchange")]
    pub sell_venue: VenueId,
    #[serde(rename = "buyPrice")]
    pub buy_price: f64,
    #[serde(rename = "sellPrice")]
    pub sell_price: f64,
    /// Sell value minus buy value, before fees, in USD.
    #[serde(rename = "spread")]
    pub gross_spread: f64,
    #[serde(rename = "spreadPercent")]
    pub spread_percent: f64,
    #[serde(rename = "estimatedProfit")]
    pub estimated_net_profit: f64,
    #[serde(rename = "buyFee")]
    pub buy_fee: f64,
    #[serde(rename = "sellFee")]
    pub sell_fee: f64,
    #[serde(rename = "totalFee")]
    pub total_fee: f64,
    /// Detection time, UTC milliseconds.
    #[serde(rename = "timestamp")]
    pub detected_at: i64,
}
