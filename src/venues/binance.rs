//! Binance client.
//!
//! Streams `<symbol>@depth` diffs from a combined-stream URL (symbols are
//! lowercased in the URL only), primes each book from the REST depth
//! endpoint, and gates every diff on the monotonic `U`/`u` update ids: a
//! diff whose final id is not newer than the book's current id is dropped.

use super::{
    http_client, ClientCore, ReconnectBackoff, SessionEnd, VenueClient, VenueError, VenueEvent,
};
use crate::book::BookUpdate;
use crate::symbols::SymbolRegistry;
use crate::types::{OrderBook, PriceLevel, TradingPair, VenueId};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const VENUE: VenueId = VenueId::Binance;

pub struct BinanceClient {
    core: ClientCore,
    symbols: Vec<String>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BinanceClient {
    pub fn new(symbols: Vec<String>, events: tokio::sync::mpsc::Sender<VenueEvent>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: ClientCore::new(VENUE, events),
            symbols,
            shutdown,
            task: Mutex::new(None),
        }
    }

    fn stream_url(symbols: &[String]) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@depth", s.to_ascii_lowercase()))
            .collect();
        format!("{}/{}", VENUE.ws_url(), streams.join("/"))
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

        let url = Self::stream_url(symbols);
        let (mut ws, _) = match connect_async(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                return SessionEnd::Dropped {
                    connected: false,
                    detail: e.to_string(),
                }
            }
        };
        info!(venue = %VENUE, streams = symbols.len(), "connected");
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
impl VenueClient for BinanceClient {
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
    let update: DepthUpdate = match serde_json::from_str(text) {
        Ok(update) => update,
        Err(e) => {
            debug!(venue = %VENUE, error = %e, "skipping unrecognized frame");
            return;
        }
    };
    if update.event != "depthUpdate" {
        return;
    }
    let book_update = BookUpdate::diff(levels(&update.bids), levels(&update.asks))
        .with_seq(update.final_id)
        .with_timestamp(update.event_time);
    core.apply(&update.symbol, book_update).await;
}

async fn fetch_depth(http: &reqwest::Client, symbol: &str) -> Result<OrderBook, VenueError> {
    let url = format!(
        "{}/api/v3/depth?symbol={}&limit={}",
        VENUE.rest_url(),
        symbol,
        VENUE.depth_limit()
    );
    let snapshot: DepthSnapshot = http.get(&url).send().await?.error_for_status()?.json().await?;

    let mut book = OrderBook::new(VENUE, symbol);
    book.apply(
        BookUpdate::snapshot(levels(&snapshot.bids), levels(&snapshot.asks))
            .with_seq(snapshot.last_update_id),
    );
    Ok(book)
}

/// Discover Binance's tradable spot pairs for the symbol registry.
pub async fn fetch_trading_pairs(http: &reqwest::Client) -> Result<Vec<TradingPair>, VenueError> {
    let url = format!("{}/api/v3/exchangeInfo", VENUE.rest_url());
    let info: ExchangeInfo = http.get(&url).send().await?.error_for_status()?.json().await?;

    let registry = SymbolRegistry::new();
    Ok(info
        .symbols
        .into_iter()
        .filter(|s| s.status == "TRADING")
        .filter_map(|s| {
            let canonical = registry.canonicalize(VENUE, &s.symbol)?;
            Some(TradingPair {
                native_symbol: s.symbol,
                base_asset: s.base_asset,
                quote_asset: s.quote_asset,
                canonical_symbol: canonical,
                active: true,
                min_order_size: None,
                tick_size: None,
            })
        })
        .collect())
}

fn levels(raw: &[(String, String)]) -> Vec<PriceLevel> {
    raw.iter()
        .map(|(price, quantity)| PriceLevel::new(price.clone(), quantity.clone()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct DepthUpdate {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "u")]
    final_id: u64,
    #[serde(rename = "b")]
    bids: Vec<(String, String)>,
    #[serde(rename = "a")]
    asks: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepthSnapshot {
    last_update_id: u64,
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeSymbol {
    symbol: String,
    status: String,
    base_asset: String,
    quote_asset: String,
}
