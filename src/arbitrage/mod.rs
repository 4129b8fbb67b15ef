//! Arbitrage Module
//!
//! Opportunity detection and fee math for cross-venue arbitrage.

pub mod detector;
pub mod fees;

pub use detector::{DetectorConfig, OpportunityDetector};
pub use fees::FeeSchedule;
