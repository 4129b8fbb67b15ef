//! Storage adapters.
//!
//! The core consumes two external stores: a key/value + pub/sub store
//! (redis) for config, status and the short-TTL book cache, and a SQLite
//! database as the durable opportunity sink.

pub mod cache;
pub mod sink;
pub mod store;

pub use cache::{cache_key, BookCache, TTL_CACHE_SECS};
pub use sink::{OpportunitySink, SinkError};
pub use store::{ConfigStore, StoreError, CONFIG_KEY, CONFIG_TOPIC, STATUS_KEY};
