//! Bybit client.
//!
//! Subscribes `orderbook.50.<SYMBOL>` topics on the public spot stream.
//! The first message per topic is a full snapshot, the rest are deltas;
//! both carry the monotonic `u` id that gates application.

use super::{
    http_client, ClientCore, ReconnectBackoff, SessionEnd, VenueClient, VenueError, VenueEvent,
};
use crate::book::BookUpdate;
use crate::types::{OrderBook, PriceLevel, VenueId};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const VENUE: VenueId = VenueId::Bybit;

pub struct BybitClient {
    core: ClientCore,
    symbols: Vec<String>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BybitClient {
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
        let topics: Vec<String> = symbols
            .iter()
            .map(|s| format!("orderbook.{}.{}", VENUE.depth_limit(), s))
            .collect();
        json!({"op": "subscribe", "args": topics}).to_string()
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
        info!(venue = %VENUE, topics = symbols.len(), "connected");
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
impl VenueClient for BybitClient {
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
    let envelope: TopicMessage = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            // Subscription acks and pong replies land here
            debug!(venue = %VENUE, error = %e, "skipping non-topic frame");
            return;
        }
    };
    if !envelope.topic.starts_with("orderbook.") {
        return;
    }

    let data = envelope.data;
    let bids = levels(&data.bids);
    let asks = levels(&data.asks);
    let mut update = if envelope.kind == "snapshot" {
        BookUpdate::snapshot(bids, asks)
    } else {
        BookUpdate::diff(bids, asks)
    };
    update = update.with_seq(data.update_id);
    if let Some(ts) = envelope.ts {
        update = update.with_timestamp(ts);
    }
    core.apply(&data.symbol, update).await;
}

async fn fetch_depth(http: &reqwest::Client, symbol: &str) -> Result<OrderBook, VenueError> {
    let url = format!(
        "{}/v5/market/orderbook?category=spot&symbol={}&limit={}",
        VENUE.rest_url(),
        symbol,
        VENUE.depth_limit()
    );
    let response: RestEnvelope = http.get(&url).send().await?.error_for_status()?.json().await?;
    if response.ret_code != 0 {
        return Err(VenueError::Handshake(format!(
            "orderbook fetch for {symbol} returned retCode {}",
            response.ret_code
        )));
    }

    let mut book = OrderBook::new(VENUE, symbol);
    let mut update = BookUpdate::snapshot(levels(&response.result.bids), levels(&response.result.asks))
        .with_seq(response.result.update_id);
    if let Some(ts) = response.result.ts {
        update = update.with_timestamp(ts);
    }
    book.apply(update);
    Ok(book)
}

fn levels(raw: &[(String, String)]) -> Vec<PriceLevel> {
    raw.iter()
        .map(|(price, quantity)| PriceLevel::new(price.clone(), quantity.clone()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct TopicMessage {
    topic: String,
    #[serde(rename = "type")]
    kind: String,
    ts: Option<i64>,
    data: BookPayload,
}

#[derive(Debug, Deserialize)]
struct BookPayload {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bids: Vec<(String, String)>,
    #[serde(rename = "a")]
    asks: Vec<(String, String)>,
    #[serde(rename = "u")]
    update_id: u64,
}

#[derive(Debug, Deserialize)]
struct RestEnvelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    result: RestBook,
}

#[derive(Debug, Deserialize)]
struct RestBook {
    #[serde(rename = "b")]
    bids: Vec<(String, String)>,
    #[serde(rename = "a")]
    asks: Vec<(String, String)>,
    #[serde(rename = "u")]
    update_id: u64,
    ts: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frame_uses_depth_topics() {
        let frame = BybitClient::subscribe_frame(&["BTCUSDT".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["args"][0], "orderbook.50.BTCUSDT");
    }

    #[test]
    fn test_parse_snapshot_message() {
        let raw = r#"{
            "topic": "orderbook.50.BTCUSDT",
            "type": "snapshot",
            "ts": 1672304484978,
            "data": {
                "s": "BTCUSDT",
                "b": [["16493.50", "0.006"]],
                "a": [["16611.00", "0.029"]],
                "u": 18521288,
                "seq": 7961638724
            }
        }"#;
        let msg: TopicMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, "snapshot");
        assert_eq!(msg.data.symbol, "BTCUSDT");
        assert_eq!(msg.data.update_id, 18521288);
        assert_eq!(msg.data.bids[0].0, "16493.50");
    }

    #[test]
    fn test_parse_delta_with_removal() {
        let raw = r#"{
            "topic": "orderbook.50.BTCUSDT",
            "type": "delta",
            "ts": 1687565704518,
            "data": {
                "s": "BTCUSDT",
                "b": [["30240.00", "0"]],
                "a": [],
                "u": 177400507
            }
        }"#;
        let msg: TopicMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, "delta");
        assert_eq!(msg.data.bids[0].1, "0");
        assert!(msg.data.asks.is_empty());
    }

    #[test]
    fn test_parse_rest_envelope() {
        let raw = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "s": "BTCUSDT",
                "a": [["65557.7", "16.606555"]],
                "b": [["65485.47", "47.081829"]],
                "ts": 1716863719031,
                "u": 230704
            }
        }"#;
        let envelope: RestEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.ret_code, 0);
        assert_eq!(envelope.result.update_id, 230704);
    }
}
