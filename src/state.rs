//! Node wiring.
//!
//! A [`RelayNode`] is one relay process: the socket registry, the
//! coordinator, the session manager, and the transfer engine, all sharing
//! one storage handle and one pub/sub fabric. The singletons are explicit
//! injected handles rather than globals, so tests can stand up several
//! nodes in one process over a shared in-memory store and fabric.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{RelayConfig, ACK_SCAN_INTERVAL_MS};
use crate::coordinator::Coordinator;
use crate::error::StorageError;
use crate::gateway::SocketRegistry;
use crate::pubsub::{PubSub, PubSubError};
use crate::registry::NodeRegistry;
use crate::session::SessionManager;
use crate::storage::Storage;
use crate::transfer::TransferEngine;

/// Cadence of the storage sweep and upload reaper.
const MAINTENANCE_INTERVAL_SECS: u64 = 60;

pub struct RelayNode {
    pub config: RelayConfig,
    pub registry: SocketRegistry,
    pub storage: Arc<dyn Storage>,
    pub pubsub: Arc<dyn PubSub>,
    pub nodes: NodeRegistry,
    pub coordinator: Arc<Coordinator>,
    pub sessions: Arc<SessionManager>,
    pub transfers: Arc<TransferEngine>,
}

impl RelayNode {
    /// Register this process in the cluster and wire the engines together.
    pub async fn new(
        config: RelayConfig,
        storage: Arc<dyn Storage>,
        pubsub: Arc<dyn PubSub>,
    ) -> Result<Arc<Self>, StorageError> {
        let nodes = NodeRegistry::register(&config, storage.clone()).await?;
        let node_id = nodes.node_id().to_string();

        let registry = SocketRegistry::new();
        let coordinator = Coordinator::new(
            node_id.clone(),
            &config,
            registry.clone(),
            storage.clone(),
            pubsub.clone(),
        );
        let sessions = SessionManager::new(
            node_id,
            config.clone(),
            registry.clone(),
            storage.clone(),
            pubsub.clone(),
            coordinator.clone(),
        );
        let transfers = TransferEngine::new(config.clone(), storage.clone(), coordinator.clone());

        Ok(Arc::new(Self {
            config,
            registry,
            storage,
            pubsub,
            nodes,
            coordinator,
            sessions,
            transfers,
        }))
    }

    pub fn node_id(&self) -> &str {
        self.nodes.node_id()
    }

    /// Attach the coordinator's fabric subscriptions.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), PubSubError> {
        self.coordinator.start(shutdown).await
    }

    /// Spawn the background timers: node heartbeat, dead-node sweep,
    /// leader election, ACK scan, and the storage sweep / upload reaper.
    /// All of them exit when the shutdown signal fires.
    pub fn spawn_timers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let this = self.clone();
        let mut heartbeat_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(this.config.heartbeat_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.nodes.heartbeat_tick().await;
                        this.nodes.sweep_dead_nodes().await;
                    }
                    _ = heartbeat_shutdown.changed() => break,
                }
            }
        }));

        handles.push(tokio::spawn(
            self.coordinator.clone().run_election_loop(shutdown.clone()),
        ));

        let this = self.clone();
        let mut ack_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(ACK_SCAN_INTERVAL_MS));
            loop {
                tokio::select! {
                    _ = interval.tick() => this.transfers.scan_pending_acks().await,
                    _ = ack_shutdown.changed() => break,
                }
            }
        }));

        let this = self.clone();
        let mut sweep_shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = this.storage.sweep_expired().await {
                            tracing::warn!(error = %e, "Storage sweep failed");
                        }
                        this.transfers.reap_uploads().await;
                    }
                    _ = sweep_shutdown.changed() => break,
                }
            }
        }));

        handles
    }

    /// Graceful teardown: deactivate this node's sessions and mark the
    /// node inactive. The master lock is left to expire on its own.
    pub async fn shutdown(&self) {
        self.nodes.shutdown().await;
    }
}
