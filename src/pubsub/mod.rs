//! Channel-named broadcast fabric.
//!
//! At-least-once local delivery with per-channel subscriber ordering.
//! Payloads are JSON values; binary data inside them is already base64
//! wrapped by the protocol layer, so everything on the wire is byte-safe.

pub mod memory;
pub mod redis_pubsub;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Serialized payloads above this size log an operational warning. Not a
/// hard cap.
pub const LARGE_PAYLOAD_WARN_BYTES: usize = 500 * 1024;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The fabric contract shared by the in-process and redis transports.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Broadcast a payload to every subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &serde_json::Value)
        -> Result<(), PubSubError>;

    /// Open a subscription. Messages arrive in publication order per
    /// channel; the subscription ends when the receiver is dropped.
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<serde_json::Value>, PubSubError>;
}

/// Publish a typed payload, logging failures instead of propagating them.
/// Publish errors never crash a caller.
pub async fn publish_event<T: Serialize>(pubsub: &dyn PubSub, channel: &str, payload: &T) {
    let value = match serde_json::to_value(payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(channel = channel, error = %e, "Failed to serialize payload");
            return;
        }
    };
    if let Err(e) = pubsub.publish(channel, &value).await {
        tracing::warn!(channel = channel, error = %e, "Publish failed");
    }
}

pub(crate) fn warn_if_oversized(channel: &str, serialized_len: usize) {
    if serialized_len > LARGE_PAYLOAD_WARN_BYTES {
        tracing::warn!(
            channel = channel,
            bytes = serialized_len,
            "Publishing oversized payload"
        );
    }
}
