//! Gemini client.
//!
//! One WebSocket per symbol on `/v1/marketdata/<symbol>`; there is no
//! subscribe frame. The first update carries the full book as `change`
//! events with reason `initial`; later updates patch single levels with
//! the `remaining` quantity.

use super::{
    http_client, ClientCore, ReconnectBackoff, SessionEnd, VenueClient, VenueError, VenueEvent,
};
use crate::book::BookUpdate;
use crate::types::{OrderBook, PriceLevel, VenueId};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const VENUE: VenueId = VenueId::Gemini;

pub struct GeminiClient {
    core: ClientCore,
    symbols: Vec<String>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GeminiClient {
    pub fn new(symbols: Vec<String>, events: tokio::sync::mpsc::Sender<VenueEvent>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: ClientCore::new(VENUE, events),
            symbols,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Per-symbol run loop; each symbol reconnects independently.
    async fn run_symbol(core: ClientCore, symbol: String, mut shutdown: watch::Receiver<bool>) {
        let http = http_client();
        let mut backoff = ReconnectBackoff::new();
        loop {
            match Self::session(&core, &symbol, &http, &mut shutdown).await {
                SessionEnd::Shutdown => return,
                SessionEnd::Dropped { connected, detail } => {
                    core.emit(VenueEvent::Error {
                        venue: VENUE,
                        detail: format!("{symbol}: {detail}"),
                        terminal: false,
                    })
                    .await;
                    core.emit(VenueEvent::Disconnected(VENUE)).await;
                    if connected {
                        backoff.reset();
                    }
                    match backoff.on_failure() {
                        Some(delay) => {
                            warn!(venue = %VENUE, symbol, ?delay, detail, "stream dropped, reconnecting");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown.wait_for(|s| *s) => return,
                            }
                        }
                        None => {
                            core.emit(VenueEvent::Error {
                                venue: VENUE,
                                detail: format!("{symbol}: reconnect attempts exhausted"),
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
        symbol: &str,
        http: &reqwest::Client,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        match fetch_book(http, symbol).await {
            Ok(book) => core.stage(book).await,
            Err(e) => {
                warn!(venue = %VENUE, symbol, error = %e, "priming failed, symbol absent until next reconnect")
            }
        }

        let url = format!("{}/{}", VENUE.ws_url(), symbol);
        let (mut ws, _) = match connect_async(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                return SessionEnd::Dropped {
                    connected: false,
                    detail: e.to_string(),
                }
            }
        };
        info!(venue = %VENUE, symbol, "connected");
        core.emit(VenueEvent::Connected(VENUE)).await;

        loop {
            let msg = tokio::select! {
                _ = shutdown.wait_for(|s| *s) => return SessionEnd::Shutdown,
                msg = ws.next() => msg,
            };
            match msg {
                Some(Ok(Message::Text(text))) => handle_message(core, symbol, &text).await,
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
impl VenueClient for GeminiClient {
    fn venue_id(&self) -> VenueId {
        VENUE
    }

    fn subscribed_symbols(&self) -> Vec<String> {
        self.symbols.clone()
    }

    async fn connect(&self) -> Result<(), VenueError> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }
        for symbol in &self.symbols {
            tasks.push(tokio::spawn(Self::run_symbol(
                self.core.clone(),
                symbol.clone(),
                self.shutdown.subscribe(),
            )));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self.shutdown.send(true);
        for handle in self.tasks.lock().await.drain(..) {
            let _ = handle.await;
        }
        self.core.clear();
        self.core.emit(VenueEvent::Disconnected(VENUE)).await;
    }

    fn local_books(&self) -> Vec<OrderBook> {
        self.core.snapshot_books()
    }
}

async fn handle_message(core: &ClientCore, symbol: &str, text: &str) {
    let message: UpdateMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(venue = %VENUE, symbol, error = %e, "skipping unparseable frame");
            return;
        }
    };
    if message.kind != "update" {
        return;
    }

    let mut bids = Vec::new();
    let mut asks = Vec::new();
    let mut all_initial = true;
    for event in &message.events {
        if event.kind != "change" {
            continue;
        }
        if event.reason.as_deref() != Some("initial") {
            all_initial = false;
        }
        let level = PriceLevel::new(event.price.clone(), event.remaining.clone());
        match event.side.as_str() {
            "bid" => bids.push(level),
            "ask" => asks.push(level),
            _ => {}
        }
    }
    if bids.is_empty() && asks.is_empty() {
        return;
    }

    // The first message is the whole book spelled as `initial` changes
    let mut update = if all_initial {
        BookUpdate::snapshot(bids, asks)
    } else {
        BookUpdate::diff(bids, asks)
    };
    if let Some(ts) = message.timestampms {
        update = update.with_timestamp(ts);
    }
    core.apply(symbol, update).await;
}

async fn fetch_book(http: &reqwest::Client, symbol: &str) -> Result<OrderBook, VenueError> {
    let url = format!("{}/v1/book/{}", VENUE.rest_url(), symbol);
    let snapshot: BookSnapshot = http.get(&url).send().await?.error_for_status()?.json().await?;

    let mut book = OrderBook::new(VENUE, symbol);
    book.apply(BookUpdate::snapshot(
        levels(&snapshot.bids),
        levels(&snapshot.asks),
    ));
    Ok(book)
}

fn levels(raw: &[BookEntry]) -> Vec<PriceLevel> {
    raw.iter()
        .map(|entry| PriceLevel::new(entry.price.clone(), entry.amount.clone()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct UpdateMessage {
    #[serde(rename = "type")]
    kind: String,
    timestampms: Option<i64>,
    #[serde(default)]
    events: Vec<ChangeEvent>,
}

#[derive(Debug, Deserialize)]
struct ChangeEvent {
    #[serde(rename = "type")]
    kind: String,
    side: String,
    price: String,
    remaining: String,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BookSnapshot {
    bids: Vec<BookEntry>,
    asks: Vec<BookEntry>,
}

#[derive(Debug, Deserialize)]
struct BookEntry {
    price: String,
    amount: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_initial_update() {
        let raw = r#"{
            "type": "update",
            "eventId": 5375547515,
            "socket_sequence": 0,
            "events": [
                {"type": "change", "side": "bid", "price": "3626.73", "remaining": "1.6", "reason": "initial"},
                {"type": "change", "side": "ask", "price": "3627.29", "remaining": "1.8", "reason": "initial"}
            ]
        }"#;
        let msg: UpdateMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, "update");
        assert!(msg
            .events
            .iter()
            .all(|e| e.reason.as_deref() == Some("initial")));
    }

    #[test]
    fn test_parse_incremental_update() {
        let raw = r#"{
            "type": "update",
            "eventId": 5375547516,
            "timestamp": 1547760288,
            "timestampms": 1547760288001,
            "socket_sequence": 15,
            "events": [
                {"type": "change", "side": "ask", "price": "3627.29", "remaining": "0", "delta": "-1.8", "reason": "cancel"}
            ]
        }"#;
        let msg: UpdateMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.timestampms, Some(1547760288001));
        assert_eq!(msg.events[0].remaining, "0");
        assert_eq!(msg.events[0].reason.as_deref(), Some("cancel"));
    }

    #[test]
    fn test_heartbeat_is_not_update() {
        let raw = r#"{"type": "heartbeat", "socket_sequence": 1656}"#;
        let msg: UpdateMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, "heartbeat");
        assert!(msg.events.is_empty());
    }

    #[test]
    fn test_parse_rest_book() {
        let raw = r#"{
            "bids": [{"price": "3607.85", "amount": "6.643373", "timestamp": "1547147541"}],
            "asks": [{"price": "3607.86", "amount": "14.68205084", "timestamp": "1547147541"}]
        }"#;
        let snapshot: BookSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(levels(&snapshot.bids)[0].price, "3607.85");
        assert_eq!(levels(&snapshot.asks)[0].quantity, "14.68205084");
    }
}
