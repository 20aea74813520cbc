//! Cluster node registry.
//!
//! Each relay process registers itself on startup, heartbeats its record,
//! and sweeps peers that stopped heartbeating. Sessions bound to a dead
//! node are flipped to disconnected so routing stops targeting it.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::config::{RelayConfig, DEAD_NODE_AFTER_SECS};
use crate::error::StorageError;
use crate::model::{Node, NodeStatus};
use crate::storage::Storage;

pub struct NodeRegistry {
    node_id: String,
    hostname: String,
    port: u16,
    storage: Arc<dyn Storage>,
}

impl NodeRegistry {
    /// Register this process in the cluster. An existing node record for
    /// the same `(hostname, port)` is reactivated under its old id so
    /// restarts keep a stable identity.
    pub async fn register(
        config: &RelayConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, StorageError> {
        let hostname = config.hostname.clone();
        let port = config.port;

        let node = match storage.find_node_by_addr(&hostname, port).await? {
            Some(mut existing) => {
                existing.status = NodeStatus::Active;
                existing.last_heartbeat = Utc::now();
                tracing::info!(
                    node_id = existing.id.as_str(),
                    "Reusing node id for {}:{}",
                    hostname,
                    port
                );
                existing
            }
            None => {
                let node = Node::new(Uuid::new_v4().to_string(), hostname.clone(), port);
                tracing::info!(
                    node_id = node.id.as_str(),
                    "Registered new node at {}:{}",
                    hostname,
                    port
                );
                node
            }
        };

        storage.put_node(&node).await?;

        Ok(Self {
            node_id: node.id,
            hostname,
            port,
            storage,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Refresh this node's heartbeat. Timer body, runs every H seconds.
    pub async fn heartbeat_tick(&self) {
        let node = match self.storage.get_node(&self.node_id).await {
            Ok(Some(mut node)) => {
                node.last_heartbeat = Utc::now();
                node.status = NodeStatus::Active;
                node
            }
            Ok(None) => {
                // Record lost (store flush); re-create it.
                let mut node = Node::new(self.node_id.clone(), self.hostname.clone(), self.port);
                node.last_heartbeat = Utc::now();
                node
            }
            Err(e) => {
                tracing::warn!(error = %e, "Node heartbeat read failed");
                return;
            }
        };

        if let Err(e) = self.storage.put_node(&node).await {
            tracing::warn!(error = %e, "Node heartbeat write failed");
        }
    }

    /// Flip stale active nodes to dead and deactivate their sessions.
    pub async fn sweep_dead_nodes(&self) {
        let nodes = match self.storage.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(error = %e, "Node sweep read failed");
                return;
            }
        };

        let cutoff = Utc::now() - Duration::seconds(DEAD_NODE_AFTER_SECS);
        for mut node in nodes {
            if node.status != NodeStatus::Active || node.last_heartbeat >= cutoff {
                continue;
            }

            tracing::warn!(
                node_id = node.id.as_str(),
                last_heartbeat = %node.last_heartbeat,
                "Marking stale node dead"
            );
            node.status = NodeStatus::Dead;
            if let Err(e) = self.storage.put_node(&node).await {
                tracing::warn!(error = %e, "Failed to mark node dead");
                continue;
            }

            match self.storage.deactivate_sessions_on_node(&node.id).await {
                Ok(touched) if touched > 0 => {
                    tracing::info!(
                        node_id = node.id.as_str(),
                        sessions = touched,
                        "Deactivated sessions on dead node"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to deactivate sessions on dead node");
                }
            }
        }
    }

    /// Graceful shutdown: deactivate this node's sessions and mark the
    /// node inactive. The master lock, if held, is left to expire.
    pub async fn shutdown(&self) {
        if let Err(e) = self.storage.deactivate_sessions_on_node(&self.node_id).await {
            tracing::warn!(error = %e, "Failed to deactivate local sessions on shutdown");
        }

        match self.storage.get_node(&self.node_id).await {
            Ok(Some(mut node)) => {
                node.status = NodeStatus::Inactive;
                if let Err(e) = self.storage.put_node(&node).await {
                    tracing::warn!(error = %e, "Failed to mark node inactive");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load node on shutdown");
            }
        }

        tracing::info!(node_id = self.node_id.as_str(), "Node deregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClientSession;
    use crate::storage::memory::MemoryStorage;

    fn config(port: u16) -> RelayConfig {
        RelayConfig {
            hostname: "test-host".to_string(),
            port,
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_register_creates_then_reuses_node_id() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());

        let first = NodeRegistry::register(&config(3001), storage.clone())
            .await
            .unwrap();
        let second = NodeRegistry::register(&config(3001), storage.clone())
            .await
            .unwrap();
        assert_eq!(first.node_id(), second.node_id());

        let other_port = NodeRegistry::register(&config(3002), storage.clone())
            .await
            .unwrap();
        assert_ne!(first.node_id(), other_port.node_id());
    }

    #[tokio::test]
    async fn test_sweep_marks_stale_nodes_dead() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let registry = NodeRegistry::register(&config(3001), storage.clone())
            .await
            .unwrap();

        // Age the peer node's heartbeat past the cutoff.
        let mut stale = Node::new("stale-node".to_string(), "other".to_string(), 3002);
        stale.last_heartbeat = Utc::now() - Duration::seconds(DEAD_NODE_AFTER_SECS + 5);
        storage.put_node(&stale).await.unwrap();

        let session = ClientSession::new(
            "alice".to_string(),
            "sock-1".to_string(),
            "stale-node".to_string(),
        );
        storage.put_session(&session).await.unwrap();

        registry.sweep_dead_nodes().await;

        let swept = storage.get_node("stale-node").await.unwrap().unwrap();
        assert_eq!(swept.status, NodeStatus::Dead);
        let session = storage.get_session("alice", "sock-1").await.unwrap().unwrap();
        assert!(!session.connected);

        // The live node is untouched.
        let live = storage.get_node(registry.node_id()).await.unwrap().unwrap();
        assert_eq!(live.status, NodeStatus::Active);
    }

    #[tokio::test]
    async fn test_shutdown_marks_node_inactive() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let registry = NodeRegistry::register(&config(3001), storage.clone())
            .await
            .unwrap();

        let session = ClientSession::new(
            "alice".to_string(),
            "sock-1".to_string(),
            registry.node_id().to_string(),
        );
        storage.put_session(&session).await.unwrap();

        registry.shutdown().await;

        let node = storage.get_node(registry.node_id()).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Inactive);
        let session = storage.get_session("alice", "sock-1").await.unwrap().unwrap();
        assert!(!session.connected);
    }
}
