//! Client sessions and share rooms.
//!
//! A share session is a two-participant rendezvous room. Clients register
//! over the event channel, then create or join shares over HTTP; the
//! manager publishes lifecycle notices on the fabric and routes the
//! participant-facing events through the coordinator, since the two peers
//! may sit on different nodes.

use std::sync::Arc;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::config::RelayConfig;
use crate::coordinator::Coordinator;
use crate::error::RelayError;
use crate::gateway::SocketRegistry;
use crate::model::{ClientSession, ShareSession, ShareStatus};
use crate::protocol::{channels, ServerEvent, SessionNotice, ShareNotice};
use crate::pubsub::{publish_event, PubSub};
use crate::storage::Storage;

pub struct SessionManager {
    node_id: String,
    config: RelayConfig,
    registry: SocketRegistry,
    storage: Arc<dyn Storage>,
    pubsub: Arc<dyn PubSub>,
    coordinator: Arc<Coordinator>,
}

impl SessionManager {
    pub fn new(
        node_id: String,
        config: RelayConfig,
        registry: SocketRegistry,
        storage: Arc<dyn Storage>,
        pubsub: Arc<dyn PubSub>,
        coordinator: Arc<Coordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            config,
            registry,
            storage,
            pubsub,
            coordinator,
        })
    }

    // ── Registration & heartbeat ──────────────────────────────────────────

    /// Create a session for a freshly bound socket and confirm it.
    pub async fn register(&self, client_id: &str, socket_id: &str) {
        let session = ClientSession::new(
            client_id.to_string(),
            socket_id.to_string(),
            self.node_id.clone(),
        );
        if let Err(e) = self.storage.put_session(&session).await {
            tracing::warn!(client = client_id, error = %e, "Failed to persist session");
        }

        if let Err(e) = self.storage.incr_counter("users_joined").await {
            tracing::debug!(error = %e, "users_joined counter update failed");
        }

        publish_event(
            self.pubsub.as_ref(),
            channels::SESSION_CREATED,
            &SessionNotice {
                client_id: client_id.to_string(),
                node_id: self.node_id.clone(),
                socket_id: socket_id.to_string(),
            },
        )
        .await;

        tracing::info!(client = client_id, socket = socket_id, "Client registered");

        self.registry.send_to_socket(
            socket_id,
            ServerEvent::Registered {
                node_id: self.node_id.clone(),
                is_master: self.coordinator.is_master(),
                master_id: self.coordinator.master_id().await,
            },
        );
    }

    /// Keepalive with a per-client rate limit.
    pub async fn heartbeat(&self, client_id: &str, socket_id: &str) {
        let decision = match self
            .storage
            .check_rate_limit(
                &format!("heartbeat:{}", client_id),
                self.config.heartbeat_limit,
                self.config.rate_limit_window_secs,
            )
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                // Fail open: a broken limiter must not kill keepalives.
                tracing::warn!(error = %e, "Rate limit check failed");
                self.registry
                    .send_to_socket(socket_id, ServerEvent::HeartbeatAck);
                return;
            }
        };

        if !decision.allowed {
            tracing::warn!(client = client_id, "Heartbeat rate limited");
            self.registry.send_to_socket(
                socket_id,
                ServerEvent::RateLimited {
                    reset_at: decision.reset_at,
                },
            );
            return;
        }

        let mut session = match self.storage.get_session(client_id, socket_id).await {
            Ok(Some(session)) => session,
            // Session expired or lost; recreate it so the TTL restarts.
            Ok(None) => ClientSession::new(
                client_id.to_string(),
                socket_id.to_string(),
                self.node_id.clone(),
            ),
            Err(e) => {
                tracing::warn!(client = client_id, error = %e, "Heartbeat session read failed");
                self.registry
                    .send_to_socket(socket_id, ServerEvent::HeartbeatAck);
                return;
            }
        };
        session.last_heartbeat = Utc::now();
        session.connected = true;
        if let Err(e) = self.storage.put_session(&session).await {
            tracing::warn!(client = client_id, error = %e, "Heartbeat session write failed");
        }

        self.registry
            .send_to_socket(socket_id, ServerEvent::HeartbeatAck);
    }

    // ── Shares ────────────────────────────────────────────────────────────

    /// Create a share session, optionally under a caller-chosen id.
    pub async fn create_share(
        &self,
        client_id: &str,
        requested_id: Option<String>,
    ) -> Result<ShareSession, RelayError> {
        let mut session = latest_session(self.storage.as_ref(), client_id)
            .await
            .ok_or_else(|| RelayError::BadRequest(format!("unknown client '{}'", client_id)))?;

        if session.share_id.is_some() {
            return Err(RelayError::AlreadyInShare(client_id.to_string()));
        }

        let share_id = requested_id.unwrap_or_else(generate_share_id);
        let share = ShareSession::new(share_id.clone(), client_id.to_string());

        if !self.storage.create_share(&share).await? {
            return Err(RelayError::DuplicateShare(share_id));
        }

        session.share_id = Some(share_id.clone());
        self.storage.put_session(&session).await?;

        publish_event(
            self.pubsub.as_ref(),
            channels::SHARE_CREATED,
            &ShareNotice {
                share_id: share_id.clone(),
                client_id: client_id.to_string(),
                node_id: self.node_id.clone(),
            },
        )
        .await;

        tracing::info!(share = share_id.as_str(), creator = client_id, "Share created");

        self.coordinator
            .route_to_client(
                client_id,
                ServerEvent::ConnectionReady {
                    share_id: share_id.clone(),
                    connected_clients: 1,
                    message: "Share session ready, waiting for a peer".to_string(),
                },
            )
            .await;

        Ok(share)
    }

    /// Join an existing share. Caps at two participants; rejoin is a
    /// no-op success.
    pub async fn join_share(
        &self,
        share_id: &str,
        client_id: &str,
    ) -> Result<ShareSession, RelayError> {
        let mut session = latest_session(self.storage.as_ref(), client_id)
            .await
            .ok_or_else(|| RelayError::BadRequest(format!("unknown client '{}'", client_id)))?;

        let mut share = self
            .storage
            .get_share(share_id)
            .await?
            .filter(|s| s.status == ShareStatus::Active)
            .ok_or_else(|| RelayError::ShareNotFound(share_id.to_string()))?;

        if share.contains(client_id) {
            share.last_activity = Utc::now();
            self.storage.put_share(&share).await?;
            return Ok(share);
        }

        if session.share_id.is_some() {
            return Err(RelayError::AlreadyInShare(client_id.to_string()));
        }

        if share.is_full() {
            return Err(RelayError::ShareFull(share_id.to_string()));
        }

        let peers = share.clients.clone();
        share.clients.push(client_id.to_string());
        share.last_activity = Utc::now();
        self.storage.put_share(&share).await?;

        session.share_id = Some(share_id.to_string());
        self.storage.put_session(&session).await?;

        tracing::info!(
            share = share_id,
            client = client_id,
            participants = share.clients.len(),
            "Client joined share"
        );

        let connected_clients = share.clients.len() as u32;
        for participant in &share.clients {
            self.coordinator
                .route_to_client(
                    participant,
                    ServerEvent::ConnectionReady {
                        share_id: share_id.to_string(),
                        connected_clients,
                        message: "Peer connected, ready to transfer".to_string(),
                    },
                )
                .await;
        }

        // Each participant learns about the other: existing peers see the
        // joiner, the joiner sees who was already there.
        for peer in &peers {
            self.coordinator
                .route_to_client(
                    peer,
                    ServerEvent::ClientJoinedShare {
                        client_id: client_id.to_string(),
                        share_id: share_id.to_string(),
                    },
                )
                .await;
            self.coordinator
                .route_to_client(
                    client_id,
                    ServerEvent::ClientJoinedShare {
                        client_id: peer.clone(),
                        share_id: share_id.to_string(),
                    },
                )
                .await;
        }

        Ok(share)
    }

    // ── Disconnect ────────────────────────────────────────────────────────

    /// Tear down a socket's session: leave the share, notify the peer,
    /// and keep the session record around (disconnected) for the grace
    /// TTL.
    pub async fn disconnect(&self, client_id: &str, socket_id: &str) {
        let session = match self.storage.get_session(client_id, socket_id).await {
            Ok(Some(session)) => Some(session),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(client = client_id, error = %e, "Disconnect session read failed");
                None
            }
        };

        if let Some(mut session) = session {
            if let Some(share_id) = session.share_id.take() {
                self.leave_share(&share_id, client_id).await;
            }
            session.connected = false;
            if let Err(e) = self.storage.put_session(&session).await {
                tracing::warn!(client = client_id, error = %e, "Disconnect session write failed");
            }
        }

        publish_event(
            self.pubsub.as_ref(),
            channels::SESSION_ENDED,
            &SessionNotice {
                client_id: client_id.to_string(),
                node_id: self.node_id.clone(),
                socket_id: socket_id.to_string(),
            },
        )
        .await;

        tracing::info!(client = client_id, socket = socket_id, "Client disconnected");
    }

    async fn leave_share(&self, share_id: &str, client_id: &str) {
        let mut share = match self.storage.get_share(share_id).await {
            Ok(Some(share)) => share,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(share = share_id, error = %e, "Share read failed on leave");
                return;
            }
        };

        share.clients.retain(|c| c != client_id);
        share.last_activity = Utc::now();

        for peer in &share.clients {
            self.coordinator
                .route_to_client(
                    peer,
                    ServerEvent::ClientDisconnectedFromShare {
                        client_id: client_id.to_string(),
                        share_id: share_id.to_string(),
                    },
                )
                .await;
        }

        let result = if share.clients.is_empty() {
            tracing::debug!(share = share_id, "Removing empty share");
            self.storage.remove_share(share_id).await
        } else {
            self.storage.put_share(&share).await
        };
        if let Err(e) = result {
            tracing::warn!(share = share_id, error = %e, "Share update failed on leave");
        }
    }
}

/// The most recently active connected session for a client.
pub(crate) async fn latest_session(
    storage: &dyn Storage,
    client_id: &str,
) -> Option<ClientSession> {
    match storage.sessions_for_client(client_id).await {
        Ok(sessions) => sessions
            .into_iter()
            .filter(|s| s.connected)
            .max_by_key(|s| s.last_heartbeat),
        Err(e) => {
            tracing::warn!(client = client_id, error = %e, "Session lookup failed");
            None
        }
    }
}

fn generate_share_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!(
        "share-{}-{}",
        Utc::now().timestamp_millis(),
        suffix.to_lowercase()
    )
}
