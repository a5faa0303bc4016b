//! Redis-backed event bus.
//!
//! Publishing goes through a [`ConnectionManager`], which transparently
//! reconnects after transient failures. Each subscription holds its own
//! dedicated pub/sub connection, since a Redis connection in subscriber
//! mode cannot issue other commands.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

use super::{BusMessage, EventBus};
use crate::events::Channel;

/// Redis pub/sub transport.
pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisBus {
    /// Connect to Redis and verify the connection with a PING.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %url, "connecting to redis");

        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis URL {url}"))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .with_context(|| format!("failed to connect to redis at {url}"))?;

        let mut conn = manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis PING failed")?;

        Ok(Self { client, manager })
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, channel: Channel, payload: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_string(payload).context("failed to encode payload")?;
        let mut conn = self.manager.clone();
        let _: () = conn
            .publish(channel.as_str(), body)
            .await
            .with_context(|| format!("failed to publish on {channel}"))?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<BoxStream<'static, BusMessage>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open pub/sub connection")?;

        for channel in channels {
            pubsub
                .subscribe(channel.as_str())
                .await
                .with_context(|| format!("failed to subscribe to {channel}"))?;
        }

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel: Channel = match msg.get_channel_name().parse() {
                Ok(ch) => ch,
                Err(e) => {
                    warn!(error = %e, "dropping message on unknown channel");
                    return None;
                }
            };
            let body: String = match msg.get_payload() {
                Ok(body) => body,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "dropping non-text message");
                    return None;
                }
            };
            match serde_json::from_str(&body) {
                Ok(payload) => Some(BusMessage { channel, payload }),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "dropping malformed message");
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
