//! Kraken client.
//!
//! One WebSocket for all symbols with a `book` subscription at depth 100.
//! Inbound data rides array frames `[channelID, payload.., "book-N",
//! "PAIR"]`; the payload is `{"bs","as"}` for the initial snapshot and
//! `{"b"}`/`{"a"}` dicts for increments (both may appear in one frame).

use super::{
    http_client, ClientCore, ReconnectBackoff, SessionEnd, VenueClient, VenueError, VenueEvent,
};
use crate::book::BookUpdate;
use crate::types::{OrderBook, PriceLevel, VenueId};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const VENUE: VenueId = VenueId::Kraken;

pub struct KrakenClient {
    core: ClientCore,
    symbols: Vec<String>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KrakenClient {
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
            "event": "subscribe",
            "pair": symbols,
            "subscription": {"name": "book", "depth": VENUE.depth_limit()},
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
            match fetch_depth(http, symbol).await {
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
        info!(venue = %VENUE, pairs = symbols.len(), "connected");
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
impl VenueClient for KrakenClient {
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
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(venue = %VENUE, error = %e, "skipping unparseable frame");
            return;
        }
    };
    match value {
        // Event frames: systemStatus, subscriptionStatus, heartbeat
        Value::Object(event) => {
            if event.get("event").and_then(Value::as_str) == Some("subscriptionStatus")
                && event.get("status").and_then(Value::as_str) == Some("error")
            {
                warn!(venue = %VENUE, frame = %serde_json::Value::Object(event), "subscription rejected");
            }
        }
        Value::Array(items) => {
            if let Some((symbol, update)) = parse_book_frame(&items) {
                core.apply(&symbol, update).await;
            }
        }
        _ => {}
    }
}

/// Decode `[channelID, payload.., "book-N", "PAIR"]` into a book update.
fn parse_book_frame(items: &[Value]) -> Option<(String, BookUpdate)> {
    if items.len() < 4 {
        return None;
    }
    let symbol = items.last()?.as_str()?.to_string();
    let channel = items[items.len() - 2].as_str()?;
    if !channel.starts_with("book") {
        return None;
    }

    let mut snapshot: Option<(Vec<PriceLevel>, Vec<PriceLevel>)> = None;
    let mut diff_bids = Vec::new();
    let mut diff_asks = Vec::new();
    for payload in &items[1..items.len() - 2] {
        let Some(payload) = payload.as_object() else {
            continue;
        };
        if payload.contains_key("bs") || payload.contains_key("as") {
            snapshot = Some((
                levels(payload.get("bs")),
                levels(payload.get("as")),
            ));
        } else {
            diff_bids.extend(levels(payload.get("b")));
            diff_asks.extend(levels(payload.get("a")));
        }
    }

    if let Some((bids, asks)) = snapshot {
        return Some((symbol, BookUpdate::snapshot(bids, asks)));
    }
    if diff_bids.is_empty() && diff_asks.is_empty() {
        return None;
    }
    Some((symbol, BookUpdate::diff(diff_bids, diff_asks)))
}

/// Kraken levels are `[price, volume, timestamp]`, sometimes with a
/// trailing republish marker; only price and volume matter here.
fn levels(raw: Option<&Value>) -> Vec<PriceLevel> {
    raw.and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let entry = entry.as_array()?;
                    Some(PriceLevel::new(entry.first()?.as_str()?, entry.get(1)?.as_str()?))
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn fetch_depth(http: &reqwest::Client, symbol: &str) -> Result<OrderBook, VenueError> {
    // The REST pair spelling drops the slash: XBT/USD -> XBTUSD
    let pair = symbol.replace('/', "");
    let url = format!(
        "{}/0/public/Depth?pair={}&count={}",
        VENUE.rest_url(),
        pair,
        VENUE.depth_limit()
    );
    let response: DepthResponse = http.get(&url).send().await?.error_for_status()?.json().await?;
    if let Some(first) = response.error.first() {
        return Err(VenueError::Handshake(first.clone()));
    }
    // The result is keyed by Kraken's internal pair name, which need not
    // match the requested spelling; there is exactly one entry.
    let depth = response
        .result
        .into_values()
        .next()
        .ok_or_else(|| VenueError::Handshake(format!("empty depth result for {symbol}")))?;

    let mut book = OrderBook::new(VENUE, symbol);
    book.apply(BookUpdate::snapshot(
        rest_levels(&depth.bids),
        rest_levels(&depth.asks),
    ));
    Ok(book)
}

fn rest_levels(raw: &[Vec<Value>]) -> Vec<PriceLevel> {
    raw.iter()
        .filter_map(|entry| {
            Some(PriceLevel::new(
                entry.first()?.as_str()?,
                entry.get(1)?.as_str()?,
            ))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: HashMap<String, DepthSide>,
}

#[derive(Debug, Deserialize)]
struct DepthSide {
    bids: Vec<Vec<Value>>,
    asks: Vec<Vec<Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frame() {
        let frame = KrakenClient::subscribe_frame(&["XBT/USD".to_string(), "ETH/USD".to_string()]);
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "subscribe");
        assert_eq!(value["pair"][0], "XBT/USD");
        assert_eq!(value["subscription"]["name"], "book");
        assert_eq!(value["subscription"]["depth"], 100);
    }

    #[test]
    fn test_parse_snapshot_frame() {
        let raw = r#"[0, {
            "bs": [["5541.30000", "2.50700000", "1534614248.123678"]],
            "as": [["5541.34000", "0.40100000", "1534614248.456738"]]
        }, "book-100", "XBT/USD"]"#;
        let items: Vec<Value> = serde_json::from_str(raw).unwrap();
        let (symbol, update) = parse_book_frame(&items).unwrap();
        assert_eq!(symbol, "XBT/USD");
        assert!(update.is_snapshot);
        assert_eq!(update.bids[0].price, "5541.30000");
        assert_eq!(update.asks[0].quantity, "0.40100000");
    }

    #[test]
    fn test_parse_split_update_frame() {
        // Bid and ask dicts can arrive as two payload elements in one frame
        let raw = r#"[1234, {
            "a": [["5541.30000", "2.50700000", "1534614248.456738"]]
        }, {
            "b": [["5541.30000", "0.00000000", "1534614335.345903"]]
        }, "book-100", "XBT/USD"]"#;
        let items: Vec<Value> = serde_json::from_str(raw).unwrap();
        let (symbol, update) = parse_book_frame(&items).unwrap();
        assert_eq!(symbol, "XBT/USD");
        assert!(!update.is_snapshot);
        assert_eq!(update.asks.len(), 1);
        assert_eq!(update.bids.len(), 1);
        assert_eq!(update.bids[0].quantity, "0.00000000");
    }

    #[test]
    fn test_non_book_frames_ignored() {
        let heartbeat: Vec<Value> =
            serde_json::from_str(r#"[42, {"x": []}, "trade", "XBT/USD"]"#).unwrap();
        assert!(parse_book_frame(&heartbeat).is_none());
        let short: Vec<Value> = serde_json::from_str(r#"[42]"#).unwrap();
        assert!(parse_book_frame(&short).is_none());
    }

    #[test]
    fn test_parse_rest_depth() {
        let raw = r#"{
            "error": [],
            "result": {
                "XXBTZUSD": {
                    "asks": [["52523.00000", "1.199", 1616663113]],
                    "bids": [["52522.90000", "0.753", 1616663112]]
                }
            }
        }"#;
        let response: DepthResponse = serde_json::from_str(raw).unwrap();
        assert!(response.error.is_empty());
        let depth = response.result.into_values().next().unwrap();
        assert_eq!(rest_levels(&depth.asks)[0].price, "52523.00000");
        assert_eq!(rest_levels(&depth.bids)[0].quantity, "0.753");
    }
}
