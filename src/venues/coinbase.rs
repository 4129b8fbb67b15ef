//! Coinbase client.
//!
//! Subscribes to the public ticker channel, which carries top-of-book only.
//! Depth below the top comes from the REST level-2 snapshot at priming time
//! and is never refreshed afterwards; each ticker replaces the best bid and
//! best ask and keeps the primed tail. Full `l2update` support needs an
//! authenticated feed and is out of scope here.

use super::{
    http_client, ClientCore, ReconnectBackoff, SessionEnd, VenueClient, VenueError, VenueEvent,
};
use crate::book::BookUpdate;
use crate::types::{OrderBook, PriceLevel, TradingPair, VenueId};
use async_trait::async_trait;
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const VENUE: VenueId = VenueId::Coinbase;

pub struct CoinbaseClient {
    core: ClientCore,
    symbols: Vec<String>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CoinbaseClient {
    pub fn new(symbols: Vec<String>, events: tokio::sync::mpsc::Sender<VenueEvent>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: ClientCore::new(VENUE, events),
            symbols,
            shutdown,
            task: Mutex::new(None),
        }
    }

    fn subscribe_frame(symbols: &[String]) -> String {
        json!({
            "type": "subscribe",
            "product_ids": symbols,
            "channels": ["ticker"],
        })
        .to_string()
    }

    async fn run(core: ClientCore, symbols: Vec<String>, mut shutdown: watch::Receiver<bool>) {
        let http = http_client();
        let mut backoff = ReconnectBackoff::new();
        loop {
            match Self::session(&core, &symbols, &http, &mut shutdown).await {
                SessionEnd::Shutdown => return,
                SessionEnd::Dropped { connected, detail } => {
                    core.emit(VenueEvent::Error {
                        venue: VENUE,
                        detail: detail.clone(),
                        terminal: false,
                    })
                    .await;
                    core.emit(VenueEvent::Disconnected(VENUE)).await;
                    if connected {
                        backoff.reset();
                    }
                    match backoff.on_failure() {
                        Some(delay) => {
                            warn!(venue = %VENUE, ?delay, detail, "stream dropped, reconnecting");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown.wait_for(|s| *s) => return,
                            }
                        }
                        None => {
                            core.emit(VenueEvent::Error {
                                venue: VENUE,
                                detail: "reconnect attempts exhausted".to_string(),
                                terminal: true,
                            })
                            .await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn session(
        core: &ClientCore,
        symbols: &[String],
        http: &reqwest::Client,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        for symbol in symbols {
            match fetch_book(http, symbol).await {
                Ok(book) => core.stage(book).await,
                Err(e) => {
                    warn!(venue = %VENUE, symbol, error = %e, "priming failed, symbol absent until next reconnect")
                }
            }
        }

        let (mut ws, _) = match connect_async(VENUE.ws_url()).await {
            Ok(conn) => conn,
            Err(e) => {
                return SessionEnd::Dropped {
                    connected: false,
                    detail: e.to_string(),
                }
            }
        };
        if let Err(e) = ws
            .send(Message::Text(Self::subscribe_frame(symbols)))
            .await
        {
            return SessionEnd::Dropped {
                connected: false,
                detail: e.to_string(),
            };
        }
        info!(venue = %VENUE, products = symbols.len(), "connected");
        core.emit(VenueEvent::Connected(VENUE)).await;

        loop {
            let msg = tokio::select! {
                _ = shutdown.wait_for(|s| *s) => return SessionEnd::Shutdown,
                msg = ws.next() => msg,
            };
            match msg {
                Some(Ok(Message::Text(text))) => handle_message(core, &text).await,
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return SessionEnd::Dropped {
                        connected: true,
                        detail: "stream closed".to_string(),
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return SessionEnd::Dropped {
                        connected: true,
                        detail: e.to_string(),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl VenueClient for CoinbaseClient {
    fn venue_id(&self) -> VenueId {
        VENUE
    }

    fn subscribed_symbols(&self) -> Vec<String> {
        self.symbols.clone()
    }

    async fn connect(&self) -> Result<(), VenueError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let handle = tokio::spawn(Self::run(
            self.core.clone(),
            self.symbols.clone(),
            self.shutdown.subscribe(),
        ));
        *task = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        self.core.clear();
        self.core.emit(VenueEvent::Disconnected(VENUE)).await;
    }

    fn local_books(&self) -> Vec<OrderBook> {
        self.core.snapshot_books()
    }
}

async fn handle_message(core: &ClientCore, text: &str) {
    let ticker: Ticker = match serde_json::from_str(text) {
        Ok(ticker) => ticker,
        Err(e) => {
            debug!(venue = %VENUE, error = %e, "skipping unrecognized frame");
            return;
        }
    };
    if ticker.kind != "ticker" {
        return;
    }

    let update = {
        let Some(book) = core.books.get(&ticker.product_id) else {
            warn!(venue = %VENUE, symbol = %ticker.product_id, "ticker for unknown symbol, discarding");
            return;
        };
        top_of_book_update(&book, &ticker)
    };
    core.apply(&ticker.product_id, update).await;
}

/// Replace the best bid/ask with the ticker's and keep the primed depth
/// strictly behind the new top.
fn top_of_book_update(book: &OrderBook, ticker: &Ticker) -> BookUpdate {
    let best_bid = ticker.best_bid.parse::<f64>().unwrap_or(0.0);
    let best_ask = ticker.best_ask.parse::<f64>().unwrap_or(f64::MAX);

    let mut bids = vec![PriceLevel::new(
        ticker.best_bid.clone(),
        ticker.best_bid_size.clone(),
    )];
    bids.extend(
        book.bids
            .iter()
            .filter(|l| l.price_f64() < best_bid)
            .cloned(),
    );
    let mut asks = vec![PriceLevel::new(
        ticker.best_ask.clone(),
        ticker.best_ask_size.clone(),
    )];
    asks.extend(
        book.asks
            .iter()
            .filter(|l| l.price_f64() > best_ask)
            .cloned(),
    );

    let mut update = BookUpdate::snapshot(bids, asks);
    if let Some(ts) = ticker
        .time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
    {
        update = update.with_timestamp(ts.timestamp_millis());
    }
    update
}

async fn fetch_book(http: &reqwest::Client, symbol: &str) -> Result<OrderBook, VenueError> {
    let url = format!("{}/products/{}/book?level=2", VENUE.rest_url(), symbol);
    let snapshot: BookSnapshot = http.get(&url).send().await?.error_for_status()?.json().await?;

    let mut book = OrderBook::new(VENUE, symbol);
    book.apply(BookUpdate::snapshot(
        levels(&snapshot.bids),
        levels(&snapshot.asks),
    ));
    Ok(book)
}

/// Discover Coinbase's online products for the symbol registry.
pub async fn fetch_trading_pairs(http: &reqwest::Client) -> Result<Vec<TradingPair>, VenueError> {
    let url = format!("{}/products", VENUE.rest_url());
    let products: Vec<Product> = http.get(&url).send().await?.error_for_status()?.json().await?;

    let registry = crate::symbols::SymbolRegistry::new();
    Ok(products
        .into_iter()
        .filter(|p| p.status == "online")
        .filter_map(|p| {
            let canonical = registry.canonicalize(VENUE, &p.id)?;
            Some(TradingPair {
                native_symbol: p.id,
                base_asset: p.base_currency,
                quote_asset: p.quote_currency,
                canonical_symbol: canonical,
                active: true,
                min_order_size: None,
                tick_size: None,
            })
        })
        .collect())
}

/// Level-2 entries are `[price, size, num_orders]`; only the first two
/// matter here.
fn levels(raw: &[(String, String, serde_json::Value)]) -> Vec<PriceLevel> {
    raw.iter()
        .map(|(price, size, _)| PriceLevel::new(price.clone(), size.clone()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct Ticker {
    #[serde(rename = "type")]
    kind: String,
    product_id: String,
    best_bid: String,
    best_bid_size: String,
    best_ask: String,
    best_ask_size: String,
    time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BookSnapshot {
    bids: Vec<(String, String, serde_json::Value)>,
    asks: Vec<(String, String, serde_json::Value)>,
}

#[derive(Debug, Deserialize)]
struct Product {
    id: String,
    base_currency: String,
    quote_currency: String,
    status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::ApplyOutcome;

    #[test]
    fn test_subscribe_frame() {
        let frame = CoinbaseClient::subscribe_frame(&["BTC-USD".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["product_ids"][0], "BTC-USD");
        assert_eq!(value["channels"][0], "ticker");
    }

    #[test]
    fn test_parse_ticker() {
        let raw = r#"{
            "type": "ticker",
            "sequence": 37475248783,
            "product_id": "BTC-USD",
            "price": "6268.48",
            "best_bid": "6267.99",
            "best_bid_size": "0.40",
            "best_ask": "6268.13",
            "best_ask_size": "0.52",
            "time": "2023-03-09T22:19:35.328319Z"
        }"#;
        let ticker: Ticker = serde_json::from_str(&raw).unwrap();
        assert_eq!(ticker.product_id, "BTC-USD");
        assert_eq!(ticker.best_bid, "6267.99");
    }

    #[test]
    fn test_parse_level2_snapshot() {
        let raw = r#"{
            "bids": [["295.96", "4.39", 2]],
            "asks": [["295.97", "25.23", 12]]
        }"#;
        let snapshot: BookSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(levels(&snapshot.bids)[0].price, "295.96");
        assert_eq!(levels(&snapshot.asks)[0].quantity, "25.23");
    }

    #[test]
    fn test_ticker_replaces_top_and_keeps_tail() {
        let mut book = OrderBook::new(VENUE, "BTC-USD");
        book.apply(BookUpdate::snapshot(
            vec![
                PriceLevel::new("100", "1"),
                PriceLevel::new("99", "1"),
                PriceLevel::new("98", "1"),
            ],
            vec![
                PriceLevel::new("101", "1"),
                PriceLevel::new("102", "1"),
                PriceLevel::new("103", "1"),
            ],
        ));

        let ticker = Ticker {
            kind: "ticker".to_string(),
            product_id: "BTC-USD".to_string(),
            best_bid: "99.5".to_string(),
            best_bid_size: "2".to_string(),
            best_ask: "100.5".to_string(),
            best_ask_size: "3".to_string(),
            time: Some("2023-03-09T22:19:35.328319Z".to_string()),
        };
        let update = top_of_book_update(&book, &ticker);
        assert_eq!(book.apply(update), ApplyOutcome::Applied);

        // New top, and the primed levels behind it survive; the stale 100
        // bid above the new top is gone
        assert_eq!(book.best_bid().unwrap().price, "99.5");
        assert_eq!(book.bids.len(), 3);
        assert_eq!(book.bids[1].price, "99");
        assert_eq!(book.best_ask().unwrap().price, "100.5");
        assert_eq!(book.asks.len(), 3);
        assert!(book.timestamp_ms > 0);
    }
}
