//! In-process event bus backed by `tokio::sync::broadcast`.
//!
//! Used by tests and single-process deployments. Matches the lossy
//! contract of the Redis transport: subscribers only see messages
//! published after they subscribed, and a lagging subscriber drops the
//! oldest messages rather than blocking publishers.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use super::{BusMessage, EventBus};
use crate::events::Channel;

/// Broadcast-channel fan-out bus.
#[derive(Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a bus with a buffer large enough for tests and small
    /// deployments.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, channel: Channel, payload: &serde_json::Value) -> Result<()> {
        // A send error only means there are no subscribers, which is fine:
        // fan-out to zero receivers is still a successful publish.
        let _ = self.sender.send(BusMessage {
            channel,
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<BoxStream<'static, BusMessage>> {
        let wanted: Vec<Channel> = channels.to_vec();
        let receiver = self.sender.subscribe();

        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let wanted = wanted.clone();
            async move {
                match item {
                    Ok(message) if wanted.contains(&message.channel) => Some(message),
                    Ok(_) => None,
                    Err(e) => {
                        // Lagged receiver: messages were dropped, which the
                        // lossy contract permits.
                        warn!(error = %e, "subscriber lagged, messages dropped");
                        None
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
