//! Venue streaming clients.
//!
//! One client per venue, all implementing [`VenueClient`]: prime books from
//! a REST depth snapshot, stream incremental updates over the public
//! WebSocket, reconstruct local books through the shared side-update rule
//! in [`crate::book`], and emit [`VenueEvent`]s over a bounded channel. The
//! variants differ only in wire framing; the connect / prime / live /
//! reconnect skeleton is the same everywhere.

pub mod backoff;
pub mod binance;
pub mod bybit;
pub mod coinbase;
pub mod gemini;
pub mod kraken;
pub mod kucoin;

pub use backoff::{ReconnectBackoff, MAX_RECONNECT_ATTEMPTS};
pub use binance::BinanceClient;
pub use bybit::BybitClient;
pub use coinbase::CoinbaseClient;
pub use gemini::GeminiClient;
pub use kraken::KrakenClient;
pub use kucoin::KucoinClient;

use crate::book::{ApplyOutcome, BookUpdate};
use crate::types::{OrderBook, VenueId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Per-call timeout for REST priming fetches.
pub const REST_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the venue-event channel into the manager. Clients block on
/// send when it fills; nothing is dropped silently.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events a venue client emits toward the manager.
#[derive(Debug, Clone)]
pub enum VenueEvent {
    Connected(VenueId),
    /// A locally reconstructed book changed.
    Book(OrderBook),
    Error {
        venue: VenueId,
        detail: String,
        /// Reconnect budget exhausted; the client will not retry.
        terminal: bool,
    },
    Disconnected(VenueId),
}

#[derive(Debug, thiserror::Error)]
pub enum VenueError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("rest request failed: {0}")]
    Rest(#[from] reqwest::Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// A streaming market-data client for one venue.
#[async_trait]
pub trait VenueClient: Send + Sync {
    fn venue_id(&self) -> VenueId;

    fn subscribed_symbols(&self) -> Vec<String>;

    /// Launch the client's streaming tasks. Returns immediately; progress
    /// and failures surface as [`VenueEvent`]s.
    async fn connect(&self) -> Result<(), VenueError>;

    /// Stop tasks, drop the socket, clear local books. Idempotent.
    async fn disconnect(&self);

    /// Snapshot of the current locally reconstructed books.
    fn local_books(&self) -> Vec<OrderBook>;
}

/// Construct the client for a venue with its resolved native symbols.
pub fn build_client(
    venue: VenueId,
    symbols: Vec<String>,
    events: mpsc::Sender<VenueEvent>,
) -> Arc<dyn VenueClient> {
    match venue {
        VenueId::Binance => Arc::new(BinanceClient::new(symbols, events)),
        VenueId::Coinbase => Arc::new(CoinbaseClient::new(symbols, events)),
        VenueId::Kraken => Arc::new(KrakenClient::new(symbols, events)),
        VenueId::Bybit => Arc::new(BybitClient::new(symbols, events)),
        VenueId::Kucoin => Arc::new(KucoinClient::new(symbols, events)),
        VenueId::Gemini => Arc::new(GeminiClient::new(symbols, events)),
    }
}

/// HTTP client with the priming timeout applied.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Why a streaming session ended.
pub(crate) enum SessionEnd {
    /// Shutdown was requested; the run loop exits without reconnecting.
    Shutdown,
    /// The socket dropped or errored. `connected` reports whether the
    /// session got far enough to subscribe, which resets the backoff.
    Dropped { connected: bool, detail: String },
}

/// State shared between a client handle and its spawned tasks: the local
/// book map and the event channel.
#[derive(Clone)]
pub(crate) struct ClientCore {
    pub venue: VenueId,
    pub books: Arc<DashMap<String, OrderBook>>,
    events: mpsc::Sender<VenueEvent>,
}

impl ClientCore {
    pub fn new(venue: VenueId, events: mpsc::Sender<VenueEvent>) -> Self {
        Self {
            venue,
            books: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Blocking send: backpressure from a full manager queue propagates to
    /// the socket read loop instead of dropping events.
    pub async fn emit(&self, event: VenueEvent) {
        let _ = self.events.send(event).await;
    }

    /// Stage a freshly primed book and announce it.
    pub async fn stage(&self, book: OrderBook) {
        self.books.insert(book.symbol.clone(), book.clone());
        self.emit(VenueEvent::Book(book)).await;
    }

    /// Apply a normalized update to the named book and emit on mutation.
    /// Updates for unknown symbols are warned about and discarded; stale
    /// sequence ids are skipped silently.
    pub async fn apply(&self, symbol: &str, update: BookUpdate) {
        let emitted = match self.books.get_mut(symbol) {
            Some(mut entry) => match entry.value_mut().apply(update) {
                ApplyOutcome::Applied => Some(entry.value().clone()),
                ApplyOutcome::StaleSeq | ApplyOutcome::RejectedCrossed => None,
            },
            None => {
                warn!(venue = %self.venue, symbol, "update for unknown symbol, discarding");
                None
            }
        };
        if let Some(book) = emitted {
            self.emit(VenueEvent::Book(book)).await;
        }
    }

    pub fn clear(&self) {
        self.books.clear();
    }

    pub fn snapshot_books(&self) -> Vec<OrderBook> {
        self.books.iter().map(|e| e.value().clone()).collect()
    }
}
