//! Order-book cache on the key/value store.
//!
//! Books are written under `orderbook:<venue>:<native-symbol>` with a short
//! TTL so a silently dead client cannot serve stale depth to readers that
//! bypass the detector's own freshness window. A miss means "unknown".

use crate::storage::store::StoreError;
use crate::types::{OrderBook, VenueId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

/// Cache entry lifetime.
pub const TTL_CACHE_SECS: u64 = 10;

pub fn cache_key(venue: VenueId, native_symbol: &str) -> String {
    format!("orderbook:{}:{}", venue, native_symbol)
}

#[derive(Clone)]
pub struct BookCache {
    conn: ConnectionManager,
}

impl BookCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn put(&self, book: &OrderBook) -> Result<(), StoreError> {
        let payload = serde_json::to_string(book)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(cache_key(book.venue, &book.symbol), payload, TTL_CACHE_SECS)
            .await?;
        Ok(())
    }

    /// Read a cached book; expired and unparseable entries both read as
    /// absent.
    pub async fn get(
        &self,
        venue: VenueId,
        native_symbol: &str,
    ) -> Result<Option<OrderBook>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(cache_key(venue, native_symbol)).await?;
        Ok(raw.and_then(|payload| match serde_json::from_str(&payload) {
            Ok(book) => Some(book),
            Err(e) => {
                warn!(venue = %venue, symbol = native_symbol, error = %e, "discarding unparseable cache entry");
                None
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        assert_eq!(
            cache_key(VenueId::Binance, "BTCUSDT"),
            "orderbook:binance:BTCUSDT"
        );
        assert_eq!(
            cache_key(VenueId::Kraken, "XBT/USD"),
            "orderbook:kraken:XBT/USD"
        );
    }
}
