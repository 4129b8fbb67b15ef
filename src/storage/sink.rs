//! Opportunity sink.
//!
//! SQLite-backed retention of emitted opportunities. Rows reference the
//! `venues` table by name; a missing venue row fails the insert once, gets
//! upserted with the built-in endpoint defaults, and the insert is retried.
//! Retention is a rolling bound: prune keeps the newest N by detection
//! time.

use crate::types::{ArbitrageOpportunity, VenueDescriptor, VenueId};
use rusqlite::{params, Connection, ErrorCode};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS venues (
    name      TEXT PRIMARY KEY,
    ws_url    TEXT NOT NULL,
    rest_url  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS opportunities (
    id               TEXT PRIMARY KEY,
    symbol           TEXT NOT NULL,
    buy_exchange     TEXT NOT NULL REFERENCES venues(name),
    sell_exchange    TEXT NOT NULL REFERENCES venues(name),
    buy_price        REAL NOT NULL,
    sell_price       REAL NOT NULL,
    spread           REAL NOT NULL,
    spread_percent   REAL NOT NULL,
    estimated_profit REAL NOT NULL,
    buy_fee          REAL NOT NULL,
    sell_fee         REAL NOT NULL,
    total_fee        REAL NOT NULL,
    timestamp        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_opportunities_timestamp ON opportunities(timestamp);
";

pub struct OpportunitySink {
    conn: Mutex<Connection>,
}

impl OpportunitySink {
    pub fn open(path: &str) -> Result<Self, SinkError> {
        Self::init(Connection::open(path)?)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, SinkError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, SinkError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert one opportunity. A venue-reference miss upserts the venue
    /// rows from their built-in descriptors and retries once; any other
    /// failure propagates.
    pub async fn append(&self, opp: &ArbitrageOpportunity) -> Result<(), SinkError> {
        let conn = self.conn.lock().await;
        match insert(&conn, opp) {
            Ok(()) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                debug!(id = %opp.id, "venue rows missing, upserting and retrying");
                ensure_venue(&conn, opp.buy_venue)?;
                ensure_venue(&conn, opp.sell_venue)?;
                insert(&conn, opp)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete everything but the newest `retention_count` rows by
    /// detection time. Returns how many rows were removed.
    pub async fn prune_to(&self, retention_count: usize) -> Result<usize, SinkError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM opportunities WHERE id NOT IN (
                SELECT id FROM opportunities
                ORDER BY timestamp DESC, rowid DESC
                LIMIT ?1
            )",
            params![retention_count as i64],
        )?;
        Ok(removed)
    }

    pub async fn count(&self) -> Result<u64, SinkError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM opportunities", [], |row| {
            row.get(0)
        })?;
        Ok(count as u64)
    }

    /// Newest `n` opportunities by detection time.
    pub async fn latest(&self, n: usize) -> Result<Vec<ArbitrageOpportunity>, SinkError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, symbol, buy_exchange, sell_exchange, buy_price, sell_price,
                    spread, spread_percent, estimated_profit, buy_fee, sell_fee,
                    total_fee, timestamp
             FROM opportunities
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![n as i64], |row| {
            Ok(ArbitrageOpportunity {
                id: row.get(0)?,
                canonical_symbol: row.get(1)?,
                buy_venue: venue_column(row.get::<_, String>(2)?)?,
                sell_venue: venue_column(row.get::<_, String>(3)?)?,
                buy_price: row.get(4)?,
                sell_price: row.get(5)?,
                gross_spread: row.get(6)?,
                spread_percent: row.get(7)?,
                estimated_net_profit: row.get(8)?,
                buy_fee: row.get(9)?,
                sell_fee: row.get(10)?,
                total_fee: row.get(11)?,
                detected_at: row.get(12)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn insert(conn: &Connection, opp: &ArbitrageOpportunity) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO opportunities (
            id, symbol, buy_exchange, sell_exchange, buy_price, sell_price,
            spread, spread_percent, estimated_profit, buy_fee, sell_fee,
            total_fee, timestamp
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            opp.id,
            opp.canonical_symbol,
            opp.buy_venue.as_str(),
            opp.sell_venue.as_str(),
            opp.buy_price,
            opp.sell_price,
            opp.gross_spread,
            opp.spread_percent,
            opp.estimated_net_profit,
            opp.buy_fee,
            opp.sell_fee,
            opp.total_fee,
            opp.detected_at,
        ],
    )?;
    Ok(())
}

fn ensure_venue(conn: &Connection, venue: VenueId) -> Result<(), rusqlite::Error> {
    let descriptor = VenueDescriptor::builtin(venue);
    conn.execute(
        "INSERT INTO venues (name, ws_url, rest_url) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO NOTHING",
        params![venue.as_str(), descriptor.ws_url, descriptor.rest_url],
    )?;
    Ok(())
}

fn venue_column(raw: String) -> Result<VenueId, rusqlite::Error> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opportunity(id: &str, timestamp: i64) -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            id: id.to_string(),
            canonical_symbol: "BTCUSD".to_string(),
            buy_venue: VenueId::Binance,
            sell_venue: VenueId::Coinbase,
            buy_price: 10_000.0,
            sell_price: 10_200.0,
            gross_spread: 20.0,
            spread_percent: 2.0,
            estimated_net_profit: 12.88,
            buy_fee: 1.0,
            sell_fee: 6.12,
            total_fee: 7.12,
            detected_at: timestamp,
        }
    }

    #[tokio::test]
    async fn test_append_upserts_missing_venues_and_retries() {
        let sink = OpportunitySink::open_in_memory().unwrap();
        // venues table starts empty, so the first insert takes the
        // constraint-miss path
        sink.append(&opportunity("opp_1_a", 1_000)).await.unwrap();
        assert_eq!(sink.count().await.unwrap(), 1);

        let conn = sink.conn.lock().await;
        let ws_url: String = conn
            .query_row(
                "SELECT ws_url FROM venues WHERE name = 'binance'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(ws_url, VenueId::Binance.ws_url());
    }

    #[tokio::test]
    async fn test_retention_keeps_newest() {
        let sink = OpportunitySink::open_in_memory().unwrap();
        for i in 0..15 {
            sink.append(&opportunity(&format!("opp_{i}"), 1_000 + i))
                .await
                .unwrap();
            sink.prune_to(10).await.unwrap();
        }
        assert_eq!(sink.count().await.unwrap(), 10);

        let latest = sink.latest(100).await.unwrap();
        assert_eq!(latest.len(), 10);
        // Newest first, and exactly the five oldest fell out
        assert_eq!(latest[0].detected_at, 1_014);
        assert_eq!(latest[9].detected_at, 1_005);
    }

    #[tokio::test]
    async fn test_prune_reports_removed_rows() {
        let sink = OpportunitySink::open_in_memory().unwrap();
        for i in 0..5 {
            sink.append(&opportunity(&format!("opp_{i}"), i)).await.unwrap();
        }
        assert_eq!(sink.prune_to(2).await.unwrap(), 3);
        assert_eq!(sink.prune_to(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_latest_roundtrips_fields() {
        let sink = OpportunitySink::open_in_memory().unwrap();
        sink.append(&opportunity("opp_1_xyz", 42)).await.unwrap();

        let rows = sink.latest(1).await.unwrap();
        let row = &rows[0];
        assert_eq!(row.id, "opp_1_xyz");
        assert_eq!(row.buy_venue, VenueId::Binance);
        assert_eq!(row.sell_venue, VenueId::Coinbase);
        assert_eq!(row.estimated_net_profit, 12.88);
        assert_eq!(row.detected_at, 42);
    }

    #[tokio::test]
    async fn test_retention_ties_broken_by_insertion_order() {
        let sink = OpportunitySink::open_in_memory().unwrap();
        // All rows share one timestamp: the later inserts win
        for i in 0..4 {
            sink.append(&opportunity(&format!("opp_{i}"), 7)).await.unwrap();
        }
        sink.prune_to(2).await.unwrap();
        let kept: Vec<String> = sink
            .latest(10)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(kept, vec!["opp_3", "opp_2"]);
    }
}
