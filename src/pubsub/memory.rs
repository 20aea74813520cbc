//! In-process pub/sub fabric.
//!
//! Per-channel subscriber lists of unbounded senders. A cloned handle
//! shares the channel table, so several relay nodes in one process can
//! talk over one fabric — the shape the integration tests rely on.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{warn_if_oversized, PubSub, PubSubError};

type Subscriber = mpsc::UnboundedSender<serde_json::Value>;

#[derive(Clone, Default)]
pub struct MemoryPubSub {
    subscribers: Arc<DashMap<String, Vec<Subscriber>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribers currently attached to a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(
        &self,
        channel: &str,
        payload: &serde_json::Value,
    ) -> Result<(), PubSubError> {
        let serialized = serde_json::to_string(payload)?;
        warn_if_oversized(channel, serialized.len());

        if let Some(mut subs) = self.subscribers.get_mut(channel) {
            // Dropped receivers fail the send; prune them as we go.
            subs.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<serde_json::Value>, PubSubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let fabric = MemoryPubSub::new();
        let mut rx1 = fabric.subscribe("share:created").await.unwrap();
        let mut rx2 = fabric.subscribe("share:created").await.unwrap();

        fabric
            .publish("share:created", &json!({ "shareId": "s1" }))
            .await
            .unwrap();

        assert_eq!(rx1.recv().await.unwrap()["shareId"], "s1");
        assert_eq!(rx2.recv().await.unwrap()["shareId"], "s1");
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let fabric = MemoryPubSub::new();
        let mut session_rx = fabric.subscribe("session:created").await.unwrap();
        let mut route_rx = fabric.subscribe("message:route").await.unwrap();

        fabric
            .publish("session:created", &json!({ "clientId": "alice" }))
            .await
            .unwrap();

        assert_eq!(session_rx.recv().await.unwrap()["clientId"], "alice");
        assert!(route_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscriber_ordering_is_preserved() {
        let fabric = MemoryPubSub::new();
        let mut rx = fabric.subscribe("message:route").await.unwrap();

        for i in 0..10 {
            fabric
                .publish("message:route", &json!({ "seq": i }))
                .await
                .unwrap();
        }

        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap()["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let fabric = MemoryPubSub::new();
        let rx = fabric.subscribe("session:ended").await.unwrap();
        assert_eq!(fabric.subscriber_count("session:ended"), 1);
        drop(rx);

        fabric
            .publish("session:ended", &json!({}))
            .await
            .unwrap();
        assert_eq!(fabric.subscriber_count("session:ended"), 0);
    }

    #[tokio::test]
    async fn test_cloned_handle_shares_the_fabric() {
        let fabric = MemoryPubSub::new();
        let other_node = fabric.clone();
        let mut rx = fabric.subscribe("routing:request").await.unwrap();

        other_node
            .publish("routing:request", &json!({ "targetClientId": "bob" }))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap()["targetClientId"], "bob");
    }
}
