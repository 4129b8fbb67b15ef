//! Config store: the key/value + pub/sub side of redis.
//!
//! `bot:config` holds the authoritative runtime configuration and
//! `bot:status` the manager's health snapshot. Replacement configs are
//! broadcast on `bot:config:update`; the manager only ever applies config
//! through that subscription, so admin writes go through
//! [`ConfigStore::publish_config`] and come back via pub/sub.

use crate::types::{BotConfig, BotStatus};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::warn;

pub const CONFIG_KEY: &str = "bot:config";
pub const STATUS_KEY: &str = "bot:status";
pub const CONFIG_TOPIC: &str = "bot:config:update";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct ConfigStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl ConfigStore {
    /// Open the read/write connection. The pub/sub subscriber gets its own
    /// connection in [`Self::subscribe_config`].
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    /// Handle to the shared read/write connection, e.g. for the book cache.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// The stored config, if any. A malformed value is treated as absent so
    /// a bad write cannot wedge startup.
    pub async fn read_config(&self) -> Result<Option<BotConfig>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(CONFIG_KEY).await?;
        Ok(raw.and_then(|payload| match serde_json::from_str(&payload) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(error = %e, "stored config is malformed, using defaults");
                None
            }
        }))
    }

    pub async fn write_config(&self, config: &BotConfig) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(CONFIG_KEY, serde_json::to_string(config)?)
            .await?;
        Ok(())
    }

    /// Admin write path: persist the config and broadcast it. The manager
    /// applies it when it arrives back on the subscription.
    pub async fn publish_config(&self, config: &BotConfig) -> Result<(), StoreError> {
        self.write_config(config).await?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(CONFIG_TOPIC, serde_json::to_string(config)?)
            .await?;
        Ok(())
    }

    pub async fn write_status(&self, status: &BotStatus) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(STATUS_KEY, serde_json::to_string(status)?)
            .await?;
        Ok(())
    }

    /// Subscribe `bot:config:update` on a dedicated connection. Malformed
    /// payloads are logged and skipped; the channel closes if the
    /// subscriber connection dies.
    pub async fn subscribe_config(&self) -> Result<mpsc::Receiver<BotConfig>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(CONFIG_TOPIC).await?;

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "unreadable config update payload");
                        continue;
                    }
                };
                match serde_json::from_str::<BotConfig>(&payload) {
                    Ok(config) => {
                        if tx.send(config).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed config update"),
                }
            }
        });
        Ok(rx)
    }
}
