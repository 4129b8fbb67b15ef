//! KuCoin client.
//!
//! The public WS endpoint is not static: a `POST /api/v1/bullet-public`
//! handshake returns an endpoint plus token, and the socket is opened at
//! `endpoint?token=...&connectId=...`. Level-2 updates arrive per symbol on
//! `/market/level2:<SYMBOL>` with `[price, size, sequence]` changes, gated
//! by `sequenceEnd`. The server drops idle sockets, so an application-level
//! `ping` goes out every 20 s.

use super::{
    http_client, ClientCore, ReconnectBackoff, SessionEnd, VenueClient, VenueError, VenueEvent,
};
use crate::book::BookUpdate;
use crate::types::{OrderBook, PriceLevel, VenueId};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const VENUE: VenueId = VenueId::Kucoin;

/// Application-level keepalive interval.
const PING_INTERVAL: Duration = Duration::from_secs(20);

pub struct KucoinClient {
    core: ClientCore,
    symbols: Vec<String>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KucoinClient {
    pub fn new(symbols: Vec<String>, events: tokio::sync::mpsc::Sender<VenueEvent>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: ClientCore::new(VENUE, events),
            symbols,
            shutdown,
            task: Mutex::new(None),
        }
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

        let url = match bullet_handshake(http).await {
            Ok(url) => url,
            Err(e) => {
                return SessionEnd::Dropped {
                    connected: false,
                    detail: e.to_string(),
                }
            }
        };
        let (mut ws, _) = match connect_async(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                return SessionEnd::Dropped {
                    connected: false,
                    detail: e.to_string(),
                }
            }
        };
        for (i, symbol) in symbols.iter().enumerate() {
            let frame = json!({
                "id": i + 1,
                "type": "subscribe",
                "topic": format!("/market/level2:{symbol}"),
                "privateChannel": false,
                "response": true,
            })
            .to_string();
            if let Err(e) = ws.send(Message::Text(frame)).await {
                return SessionEnd::Dropped {
                    connected: false,
                    detail: e.to_string(),
                };
            }
        }
        info!(venue = %VENUE, topics = symbols.len(), "connected");
        core.emit(VenueEvent::Connected(VENUE)).await;

        enum Step {
            Shutdown,
            Ping,
            Socket(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
        }

        let mut keepalive = tokio::time::interval(PING_INTERVAL);
        keepalive.reset();
        let mut ping_id: u64 = 0;
        loop {
            let step = tokio::select! {
                _ = shutdown.wait_for(|s| *s) => Step::Shutdown,
                _ = keepalive.tick() => Step::Ping,
                msg = ws.next() => Step::Socket(msg),
            };
            let msg = match step {
                Step::Shutdown => return SessionEnd::Shutdown,
                Step::Ping => {
                    ping_id += 1;
                    let ping = json!({"id": ping_id.to_string(), "type": "ping"}).to_string();
                    if let Err(e) = ws.send(Message::Text(ping)).await {
                        return SessionEnd::Dropped {
                            connected: true,
                            detail: e.to_string(),
                        };
                    }
                    continue;
                }
                Step::Socket(msg) => msg,
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
impl VenueClient for KucoinClient {
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

/// `POST /bullet-public`, returning the tokenized WS URL.
async fn bullet_handshake(http: &reqwest::Client) -> Result<String, VenueError> {
    let response: BulletResponse = http
        .post(VENUE.ws_url())
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let server = response
        .data
        .instance_servers
        .into_iter()
        .next()
        .ok_or_else(|| VenueError::Handshake("bullet-public returned no servers".to_string()))?;
    let connect_id: u64 = rand::thread_rng().gen();
    Ok(format!(
        "{}?token={}&connectId={}",
        server.endpoint, response.data.token, connect_id
    ))
}

async fn handle_message(core: &ClientCore, text: &str) {
    let envelope: WsMessage = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(venue = %VENUE, error = %e, "skipping unparseable frame");
            return;
        }
    };
    // welcome / ack / pong frames have no data payload
    let (Some(subject), Some(data)) = (envelope.subject.as_deref(), envelope.data) else {
        return;
    };
    if subject != "trade.l2update" {
        return;
    }

    let update = BookUpdate::diff(levels(&data.changes.bids), levels(&data.changes.asks))
        .with_seq(data.sequence_end);
    core.apply(&data.symbol, update).await;
}

async fn fetch_depth(http: &reqwest::Client, symbol: &str) -> Result<OrderBook, VenueError> {
    let url = format!(
        "{}/api/v1/market/orderbook/level2_100?symbol={}",
        VENUE.rest_url(),
        symbol
    );
    let response: RestEnvelope = http.get(&url).send().await?.error_for_status()?.json().await?;
    if response.code != "200000" {
        return Err(VenueError::Handshake(format!(
            "level2 snapshot for {symbol} returned code {}",
            response.code
        )));
    }

    let mut book = OrderBook::new(VENUE, symbol);
    let mut update = BookUpdate::snapshot(
        rest_levels(&response.data.bids),
        rest_levels(&response.data.asks),
    );
    if let Ok(seq) = response.data.sequence.parse::<u64>() {
        update = update.with_seq(seq);
    }
    if let Some(ts) = response.data.time {
        update = update.with_timestamp(ts);
    }
    book.apply(update);
    Ok(book)
}

/// Change entries are `[price, size, sequence]`.
fn levels(raw: &[(String, String, String)]) -> Vec<PriceLevel> {
    raw.iter()
        .map(|(price, size, _)| PriceLevel::new(price.clone(), size.clone()))
        .collect()
}

fn rest_levels(raw: &[(String, String)]) -> Vec<PriceLevel> {
    raw.iter()
        .map(|(price, size)| PriceLevel::new(price.clone(), size.clone()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct BulletResponse {
    data: BulletData,
}

#[derive(Debug, Deserialize)]
struct BulletData {
    token: String,
    #[serde(rename = "instanceServers")]
    instance_servers: Vec<InstanceServer>,
}

#[derive(Debug, Deserialize)]
struct InstanceServer {
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct WsMessage {
    subject: Option<String>,
    data: Option<L2Update>,
}

#[derive(Debug, Deserialize)]
struct L2Update {
    symbol: String,
    #[serde(rename = "sequenceEnd")]
    sequence_end: u64,
    changes: L2Changes,
}

#[derive(Debug, Deserialize)]
struct L2Changes {
    #[serde(default)]
    bids: Vec<(String, String, String)>,
    #[serde(default)]
    asks: Vec<(String, String, String)>,
}

#[derive(Debug, Deserialize)]
struct RestEnvelope {
    code: String,
    data: RestBook,
}

#[derive(Debug, Deserialize)]
struct RestBook {
    sequence: String,
    time: Option<i64>,
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bullet_response() {
        let raw = r#"{
            "code": "200000",
            "data": {
                "token": "2neAiuYvAU61ZD",
                "instanceServers": [
                    {"endpoint": "wss://ws-api-spot.kucoin.com/", "protocol": "websocket", "pingInterval": 18000}
                ]
            }
        }"#;
        let response: BulletResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.data.token, "2neAiuYvAU61ZD");
        assert_eq!(
            response.data.instance_servers[0].endpoint,
            "wss://ws-api-spot.kucoin.com/"
        );
    }

    #[test]
    fn test_parse_l2update() {
        let raw = r#"{
            "type": "message",
            "topic": "/market/level2:BTC-USDT",
            "subject": "trade.l2update",
            "data": {
                "changes": {
                    "asks": [["18906", "0.00331", "14103845"]],
                    "bids": [["18904", "0.25", "14103844"]]
                },
                "sequenceEnd": 14103845,
                "sequenceStart": 14103844,
                "symbol": "BTC-USDT",
                "time": 1663747970273
            }
        }"#;
        let msg: WsMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.subject.as_deref(), Some("trade.l2update"));
        let data = msg.data.unwrap();
        assert_eq!(data.symbol, "BTC-USDT");
        assert_eq!(data.sequence_end, 14103845);
        assert_eq!(levels(&data.changes.asks)[0].price, "18906");
    }

    #[test]
    fn test_welcome_frame_is_ignored_shape() {
        let raw = r#"{"id": "hQvf8jkno", "type": "welcome"}"#;
        let msg: WsMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.subject.is_none());
        assert!(msg.data.is_none());
    }

    #[test]
    fn test_parse_rest_snapshot() {
        let raw = r#"{
            "code": "200000",
            "data": {
                "time": 1602205191965,
                "sequence": "3262786978",
                "bids": [["6500.12", "0.45054140"]],
                "asks": [["6500.16", "0.57753524"]]
            }
        }"#;
        let envelope: RestEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.code, "200000");
        assert_eq!(envelope.data.sequence, "3262786978");
        assert_eq!(rest_levels(&envelope.data.bids)[0].quantity, "0.45054140");
    }
}
