//! Cross-Exchange Arbitrage Monitor Library
//!
//! Live order-book replicas across six venues, a canonical symbol layer,
//! and a throttled detector that emits two-leg opportunities when the net
//! spread clears fees plus a slippage buffer. A config-driven manager wires
//! venues and symbols to the pipeline and reshapes it at runtime.

pub mod arbitrage;
pub mod book;
pub mod config;
pub mod manager;
pub mod storage;
pub mod symbols;
pub mod types;
pub mod venues;

// Re-export commonly used types
pub use arbitrage::{DetectorConfig, FeeSchedule, OpportunityDetector};
pub use config::load_config;
pub use manager::{BotManager, MonitorEvent};
pub use storage::{BookCache, ConfigStore, OpportunitySink};
pub use symbols::SymbolRegistry;
pub use types::{ArbitrageOpportunity, BotConfig, BotStatus, OrderBook, PriceLevel, VenueId};
