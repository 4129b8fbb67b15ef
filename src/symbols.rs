//! Symbol identity layer.
//!
//! Canonical symbols (e.g. `BTCUSD`) let the detector compare books across
//! venues that each spell the pair differently (`BTCUSDT`, `BTC-USD`,
//! `XBT/USD`, `btcusd`). Translation runs through a per-venue formatting
//! recipe, with discovery overrides taking precedence when a venue's pair
//! list has been registered.

use crate::types::{TradingPair, VenueId};
use once_cell::sync::Lazy;
use std::collections::HashMap;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SymbolError {
    #[error("unknown venue: {0}")]
    UnknownVenue(String),
    #[error("unparseable symbol: {0}")]
    Unparseable(String),
}

/// Quote assets tried when splitting a concatenated symbol, longest match
/// first in this order.
const QUOTE_SPLIT_ORDER: [&str; 7] = ["USDT", "USDC", "USD", "EUR", "BTC", "ETH", "BNB"];

/// Dollar-pegged quotes collapsed to USD for comparison.
const STABLE_QUOTES: [&str; 4] = ["USDT", "USDC", "BUSD", "DAI"];

/// Venue-specific asset spellings mapped back to the canonical asset.
static ASSET_ALIASES: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| HashMap::from([("XBT", "BTC")]));

/// How a venue spells a pair on the wire.
struct NativeFormat {
    lowercase: bool,
    separator: &'static str,
    /// What the canonical USD quote becomes on this venue.
    usd_quote: &'static str,
    /// Asset respellings applied when formatting (canonical -> native).
    asset_rewrites: &'static [(&'static str, &'static str)],
}

fn native_format(venue: VenueId) -> NativeFormat {
    match venue {
        VenueId::Binance => NativeFormat {
            lowercase: false,
            separator: "",
            usd_quote: "USDT",
            asset_rewrites: &[],
        },
        VenueId::Coinbase => NativeFormat {
            lowercase: false,
            separator: "-",
            usd_quote: "USD",
            asset_rewrites: &[],
        },
        VenueId::Kraken => NativeFormat {
            lowercase: false,
            separator: "/",
            usd_quote: "USD",
            asset_rewrites: &[("BTC", "XBT")],
        },
        VenueId::Bybit => NativeFormat {
            lowercase: false,
            separator: "",
            usd_quote: "USDT",
            asset_rewrites: &[],
        },
        VenueId::Kucoin => NativeFormat {
            lowercase: false,
            separator: "-",
            usd_quote: "USDT",
            asset_rewrites: &[],
        },
        VenueId::Gemini => NativeFormat {
            lowercase: true,
            separator: "",
            usd_quote: "USD",
            asset_rewrites: &[],
        },
    }
}

/// Split a concatenated symbol into (base, quote) by peeling the longest
/// matching known quote off the right.
fn split_concatenated(symbol: &str) -> Result<(String, String), SymbolError> {
    for quote in QUOTE_SPLIT_ORDER {
        if symbol.len() > quote.len() && symbol.ends_with(quote) {
            let base = &symbol[..symbol.len() - quote.len()];
            return Ok((base.to_string(), quote.to_string()));
        }
    }
    Err(SymbolError::Unparseable(symbol.to_string()))
}

/// Canonical <-> native symbol translation with discovery overrides.
#[derive(Debug, Clone, Default)]
pub struct SymbolRegistry {
    /// Collapse {USDT, USDC, BUSD, DAI} quotes to USD for comparison.
    quote_equivalence: bool,
    /// Discovery overrides: native -> canonical per venue.
    by_native: HashMap<VenueId, HashMap<String, String>>,
    /// Discovery overrides: canonical -> native per venue.
    by_canonical: HashMap<VenueId, HashMap<String, String>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self {
            quote_equivalence: true,
            ..Default::default()
        }
    }

    /// Disable USD/USDT/USDC/BUSD/DAI quote conflation. With the class off,
    /// `BTCUSDT` and `BTCUSD` are distinct canonical symbols.
    pub fn without_quote_equivalence(mut self) -> Self {
        self.quote_equivalence = false;
        self
    }

    /// Install a venue's discovered pair list. Registered venues answer
    /// lookups from these maps instead of the formatting recipe.
    pub fn register_pairs(&mut self, venue: VenueId, pairs: &[TradingPair]) {
        let native_map = self.by_native.entry(venue).or_default();
        let canonical_map = self.by_canonical.entry(venue).or_default();
        for pair in pairs.iter().filter(|p| p.active) {
            native_map.insert(pair.native_symbol.clone(), pair.canonical_symbol.clone());
            canonical_map.insert(pair.canonical_symbol.clone(), pair.native_symbol.clone());
        }
    }

    fn canonical_asset(&self, asset: &str) -> String {
        let upper = asset.to_ascii_uppercase();
        match ASSET_ALIASES.get(upper.as_str()) {
            Some(canonical) => (*canonical).to_string(),
            None => upper,
        }
    }

    fn canonical_quote(&self, quote: &str) -> String {
        let quote = self.canonical_asset(quote);
        if self.quote_equivalence && STABLE_QUOTES.contains(&quote.as_str()) {
            "USD".to_string()
        } else {
            quote
        }
    }

    /// Canonical identity of a venue's native symbol, or `None` when the
    /// spelling cannot be resolved. Non-fatal: callers drop the pair.
    pub fn canonicalize(&self, venue: VenueId, native_symbol: &str) -> Option<String> {
        if let Some(canonical) = self
            .by_native
            .get(&venue)
            .and_then(|m| m.get(native_symbol))
        {
            return Some(canonical.clone());
        }

        let format = native_format(venue);
        let upper = native_symbol.to_ascii_uppercase();
        let (base, quote) = if format.separator.is_empty() {
            split_concatenated(&upper).ok()?
        } else {
            let mut parts = upper.splitn(2, format.separator);
            let base = parts.next()?.to_string();
            let quote = parts.next()?.to_string();
            if base.is_empty() || quote.is_empty() {
                return None;
            }
            (base, quote)
        };

        Some(format!(
            "{}{}",
            self.canonical_asset(&base),
            self.canonical_quote(&quote)
        ))
    }

    /// The venue's native spelling of a canonical symbol, or `None` when the
    /// venue has a registered pair list that lacks it or the canonical form
    /// does not parse.
    pub fn to_native(&self, canonical_symbol: &str, venue: VenueId) -> Option<String> {
        if let Some(native_map) = self.by_canonical.get(&venue) {
            if !native_map.is_empty() {
                return native_map.get(canonical_symbol).cloned();
            }
        }

        let (base, quote) = split_concatenated(&canonical_symbol.to_ascii_uppercase()).ok()?;
        let format = native_format(venue);

        let mut base = base;
        let mut quote = if quote == "USD" {
            format.usd_quote.to_string()
        } else {
            quote
        };
        for (from, to) in format.asset_rewrites {
            if base == *from {
                base = (*to).to_string();
            }
            if quote == *from {
                quote = (*to).to_string();
            }
        }

        let native = format!("{}{}{}", base, format.separator, quote);
        Some(if format.lowercase {
            native.to_ascii_lowercase()
        } else {
            native
        })
    }

    /// Canonical symbols resolvable on *every* requested venue, restricted
    /// to USD-quoted pairs over the given base assets. Returns canonical ->
    /// (venue -> native).
    pub fn common_symbols(
        &self,
        venue_ids: &[VenueId],
        base_asset_whitelist: &[&str],
    ) -> HashMap<String, HashMap<VenueId, String>> {
        let mut out = HashMap::new();
        for base in base_asset_whitelist {
            let canonical = format!("{}USD", base.to_ascii_uppercase());
            let mut natives = HashMap::new();
            for &venue in venue_ids {
                match self.to_native(&canonical, venue) {
                    Some(native) => {
                        natives.insert(venue, native);
                    }
                    None => {
                        natives.clear();
                        break;
                    }
                }
            }
            if !natives.is_empty() && natives.len() == venue_ids.len() {
                out.insert(canonical, natives);
            }
        }
        out
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(native: &str, canonical: &str) -> TradingPair {
        let (base, quote) = split_concatenated(canonical).unwrap();
        TradingPair {
            native_symbol: native.to_string(),
            base_asset: base,
            quote_asset: quote,
            canonical_symbol: canonical.to_string(),
            active: true,
            min_order_size: None,
            tick_size: None,
        }
    }

    #[test]
    fn test_to_native_per_venue_recipes() {
        let registry = SymbolRegistry::new();
        assert_eq!(
            registry.to_native("BTCUSD", VenueId::Binance).unwrap(),
            "BTCUSDT"
        );
        assert_eq!(
            registry.to_native("BTCUSD", VenueId::Coinbase).unwrap(),
            "BTC-USD"
        );
        assert_eq!(
            registry.to_native("BTCUSD", VenueId::Kraken).unwrap(),
            "XBT/USD"
        );
        assert_eq!(
            registry.to_native("BTCUSD", VenueId::Bybit).unwrap(),
            "BTCUSDT"
        );
        assert_eq!(
            registry.to_native("BTCUSD", VenueId::Kucoin).unwrap(),
            "BTC-USDT"
        );
        assert_eq!(
            registry.to_native("BTCUSD", VenueId::Gemini).unwrap(),
            "btcusd"
        );
    }

    #[test]
    fn test_canonicalize_collapses_aliases_and_stables() {
        let registry = SymbolRegistry::new();
        assert_eq!(
            registry.canonicalize(VenueId::Binance, "BTCUSDT").unwrap(),
            "BTCUSD"
        );
        assert_eq!(
            registry.canonicalize(VenueId::Kraken, "XBT/USD").unwrap(),
            "BTCUSD"
        );
        assert_eq!(
            registry.canonicalize(VenueId::Gemini, "ethusd").unwrap(),
            "ETHUSD"
        );
        assert_eq!(
            registry.canonicalize(VenueId::Coinbase, "ETH-USDC").unwrap(),
            "ETHUSD"
        );
        assert_eq!(
            registry.canonicalize(VenueId::Kraken, "ETH/XBT").unwrap(),
            "ETHBTC"
        );
    }

    #[test]
    fn test_quote_equivalence_flag() {
        let registry = SymbolRegistry::new().without_quote_equivalence();
        assert_eq!(
            registry.canonicalize(VenueId::Binance, "BTCUSDT").unwrap(),
            "BTCUSDT"
        );
    }

    #[test]
    fn test_round_trip_every_venue() {
        let registry = SymbolRegistry::new();
        for canonical in ["BTCUSD", "ETHUSD", "ETHBTC", "SOLUSD"] {
            for venue in VenueId::ALL {
                let native = registry.to_native(canonical, venue).unwrap();
                assert_eq!(
                    registry.canonicalize(venue, &native).as_deref(),
                    Some(canonical),
                    "round trip failed for {canonical} on {venue}"
                );
            }
        }
    }

    #[test]
    fn test_unparseable_symbol() {
        let registry = SymbolRegistry::new();
        assert!(registry.canonicalize(VenueId::Binance, "FOO").is_none());
        assert!(registry.to_native("FOO", VenueId::Binance).is_none());
        // Quote alone is not a pair
        assert!(registry.canonicalize(VenueId::Binance, "USDT").is_none());
    }

    #[test]
    fn test_quote_split_prefers_longest_match() {
        // BTCUSDT must split as BTC/USDT, not BTCUSD+T
        let (base, quote) = split_concatenated("BTCUSDT").unwrap();
        assert_eq!((base.as_str(), quote.as_str()), ("BTC", "USDT"));
        let (base, quote) = split_concatenated("ETHBNB").unwrap();
        assert_eq!((base.as_str(), quote.as_str()), ("ETH", "BNB"));
    }

    #[test]
    fn test_registered_pairs_take_precedence() {
        let mut registry = SymbolRegistry::new();
        registry.register_pairs(
            VenueId::Kraken,
            &[pair("XXBTZUSD", "BTCUSD"), pair("XETHZUSD", "ETHUSD")],
        );
        assert_eq!(
            registry.to_native("BTCUSD", VenueId::Kraken).unwrap(),
            "XXBTZUSD"
        );
        assert_eq!(
            registry.canonicalize(VenueId::Kraken, "XXBTZUSD").unwrap(),
            "BTCUSD"
        );
        // A registered venue no longer falls back to the recipe
        assert!(registry.to_native("DOGEUSD", VenueId::Kraken).is_none());
        // Unregistered venues still use the recipe
        assert_eq!(
            registry.to_native("DOGEUSD", VenueId::Binance).unwrap(),
            "DOGEUSDT"
        );
    }

    #[test]
    fn test_common_symbols_intersection() {
        let mut registry = SymbolRegistry::new();
        // Kraken's discovered list lacks DOGE
        registry.register_pairs(
            VenueId::Kraken,
            &[pair("XBT/USD", "BTCUSD"), pair("ETH/USD", "ETHUSD")],
        );
        let venues = [VenueId::Binance, VenueId::Coinbase, VenueId::Kraken];
        let common = registry.common_symbols(&venues, &["BTC", "ETH", "DOGE"]);

        assert_eq!(common.len(), 2);
        assert!(common.contains_key("BTCUSD"));
        assert!(common.contains_key("ETHUSD"));
        assert!(!common.contains_key("DOGEUSD"));

        let btc = &common["BTCUSD"];
        assert_eq!(btc[&VenueId::Binance], "BTCUSDT");
        assert_eq!(btc[&VenueId::Coinbase], "BTC-USD");
        assert_eq!(btc[&VenueId::Kraken], "XBT/USD");
    }
}
