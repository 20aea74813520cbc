//! Redis pub/sub fabric.
//!
//! Publishing goes through the shared connection manager; every
//! subscription gets its own pub/sub connection feeding an unbounded
//! channel from a reader task. The reader stops when the subscriber drops
//! its receiver.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;

use super::{warn_if_oversized, PubSub, PubSubError};

#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisPubSub {
    pub async fn connect(url: &str) -> Result<Self, PubSubError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(
        &self,
        channel: &str,
        payload: &serde_json::Value,
    ) -> Result<(), PubSubError> {
        let serialized = serde_json::to_string(payload)?;
        warn_if_oversized(channel, serialized.len());

        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(serialized)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<serde_json::Value>, PubSubError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let raw: String = match msg.get_payload() {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(channel = channel.as_str(), error = %e, "Bad payload");
                        continue;
                    }
                };
                let value: serde_json::Value = match serde_json::from_str(&raw) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(
                            channel = channel.as_str(),
                            error = %e,
                            "Unparseable message dropped"
                        );
                        continue;
                    }
                };
                if tx.send(value).is_err() {
                    // Subscriber went away; stop reading.
                    break;
                }
            }
            tracing::debug!(channel = channel.as_str(), "Subscription reader stopped");
        });

        Ok(rx)
    }
}
