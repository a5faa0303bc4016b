//! Event bus adapter: publish/subscribe over named channels with JSON
//! payloads.
//!
//! Delivery is best-effort fan-out. Every live subscriber on a channel
//! receives each published message; late subscribers do not receive prior
//! messages, and lagging subscribers may drop messages. The engine treats
//! the store as the source of truth and the bus as a notification layer,
//! so a lost message is recovered by the failure detector or an operator
//! re-queue, never by the bus itself.

pub mod memory;
pub mod redis;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::error;

use crate::events::{Channel, Event};

pub use self::memory::MemoryBus;
pub use self::redis::RedisBus;

/// A message received from a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: Channel,
    pub payload: serde_json::Value,
}

/// Publish/subscribe over named channels.
///
/// Object-safe so processes can be constructed against `Arc<dyn EventBus>`
/// and tests can swap the Redis transport for [`MemoryBus`].
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a JSON payload on a channel.
    async fn publish(&self, channel: Channel, payload: &serde_json::Value) -> Result<()>;

    /// Subscribe to a set of channels, yielding messages as they arrive.
    ///
    /// The stream ends when the underlying connection closes.
    async fn subscribe(&self, channels: &[Channel]) -> Result<BoxStream<'static, BusMessage>>;
}

/// Publish a typed event, logging and swallowing failures.
///
/// Publication failures must not abort the caller: the state of record in
/// the store is already committed, and downstream actors reconcile via the
/// failure detector.
pub async fn publish_event<E: Event>(bus: &dyn EventBus, event: &E) {
    let payload = match serde_json::to_value(event) {
        Ok(v) => v,
        Err(e) => {
            error!(channel = %E::CHANNEL, error = %e, "failed to serialize event");
            return;
        }
    };

    if let Err(e) = bus.publish(E::CHANNEL, &payload).await {
        error!(channel = %E::CHANNEL, error = %e, "failed to publish event");
    }
}

/// Decode a message payload into a typed event.
///
/// Returns `None` (after logging) for malformed payloads; callers drop the
/// message.
pub fn decode_message<E>(message: &BusMessage) -> Option<E>
where
    E: serde::de::DeserializeOwned,
{
    match serde_json::from_value(message.payload.clone()) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(
                channel = %message.channel,
                error = %e,
                "dropping malformed message"
            );
            None
        }
    }
}
