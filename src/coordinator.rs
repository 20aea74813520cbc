//! Cluster coordination: leader election and cross-node routing.
//!
//! Election is a single atomic set-if-not-exists with expiry on the
//! `cluster:master` key, re-asserted on a shorter cadence than the lease.
//! Routing tries the local socket table first and escalates through the
//! shared store and the pub/sub fabric; the current master is the routing
//! authority of last resort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::config::RelayConfig;
use crate::gateway::SocketRegistry;
use crate::model::{ClientSession, NodeRole};
use crate::protocol::{channels, RoutedMessage, RoutingRequest, ServerEvent};
use crate::pubsub::{publish_event, PubSub, PubSubError};
use crate::storage::Storage;

/// Cap on routing requests buffered while no master is known.
const PENDING_REQUEST_CAP: usize = 256;

pub struct Coordinator {
    node_id: String,
    registry: SocketRegistry,
    storage: Arc<dyn Storage>,
    pubsub: Arc<dyn PubSub>,
    is_master: AtomicBool,
    lock_ttl_secs: u64,
    election_interval_secs: u64,
    /// Routing requests seen while this node was a worker. Served on
    /// promotion so escalations issued during a failover gap still land.
    pending_requests: Mutex<Vec<(Instant, RoutingRequest)>>,
}

impl Coordinator {
    pub fn new(
        node_id: String,
        config: &RelayConfig,
        registry: SocketRegistry,
        storage: Arc<dyn Storage>,
        pubsub: Arc<dyn PubSub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            registry,
            storage,
            pubsub,
            is_master: AtomicBool::new(false),
            lock_ttl_secs: config.master_lock_ttl_secs,
            election_interval_secs: config.election_interval_secs,
            pending_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    /// Current lock holder as the store sees it.
    pub async fn master_id(&self) -> Option<String> {
        match self.storage.current_master().await {
            Ok(holder) => holder,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read master lock");
                None
            }
        }
    }

    // ── Leader election ───────────────────────────────────────────────────

    /// One election round. The election cadence is shorter than the lock
    /// lease, so a vanished master is replaced within one lease.
    pub async fn election_tick(&self) {
        match self
            .storage
            .try_acquire_master_lock(&self.node_id, self.lock_ttl_secs)
            .await
        {
            Ok(true) => self.assume_role(NodeRole::Master).await,
            Ok(false) => match self.storage.current_master().await {
                Ok(Some(holder)) if holder == self.node_id => {
                    match self
                        .storage
                        .refresh_master_lock(&self.node_id, self.lock_ttl_secs)
                        .await
                    {
                        Ok(true) => self.assume_role(NodeRole::Master).await,
                        Ok(false) => {
                            // Lost the lease between read and refresh.
                            self.assume_role(NodeRole::Worker).await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Master lock refresh failed");
                        }
                    }
                }
                Ok(_) => self.assume_role(NodeRole::Worker).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read master lock holder");
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Election round failed");
            }
        }
    }

    async fn assume_role(&self, role: NodeRole) {
        let now_master = role == NodeRole::Master;
        let was_master = self.is_master.swap(now_master, Ordering::SeqCst);
        if was_master == now_master {
            return;
        }

        tracing::info!(
            node_id = self.node_id.as_str(),
            role = role.as_str(),
            "Cluster role changed"
        );

        // Keep the node record's role in step with the lock.
        match self.storage.get_node(&self.node_id).await {
            Ok(Some(mut node)) => {
                node.role = role;
                if let Err(e) = self.storage.put_node(&node).await {
                    tracing::warn!(error = %e, "Failed to persist node role");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load node for role update");
            }
        }

        self.registry.broadcast_local(ServerEvent::ClusterRoleChange {
            node_id: self.node_id.clone(),
            role: role.as_str().to_string(),
            is_master: now_master,
        });

        if now_master {
            self.serve_buffered_requests().await;
        }
    }

    /// Serve routing requests that arrived while this node was a worker.
    async fn serve_buffered_requests(&self) {
        let buffered: Vec<RoutingRequest> = {
            let mut pending = self.pending_requests.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain(..).map(|(_, request)| request).collect()
        };
        for request in buffered {
            let sessions = match self
                .storage
                .sessions_for_client(&request.target_client_id)
                .await
            {
                Ok(sessions) => sessions,
                Err(e) => {
                    tracing::warn!(error = %e, "Buffered routing lookup failed");
                    continue;
                }
            };
            self.master_route(&request.target_client_id, request.event, &sessions)
                .await;
        }
    }

    /// Election loop; exits on shutdown.
    pub async fn run_election_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.election_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => self.election_tick().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    // ── Routing ───────────────────────────────────────────────────────────

    /// Deliver an event to a client wherever it is connected.
    ///
    /// Returns true when the event reached a local socket or was forwarded
    /// toward a node that has a live session for the client. False means
    /// nothing is known to be listening (a `routing:request` may still be
    /// in flight to the master).
    pub async fn route_to_client(&self, target_client_id: &str, event: ServerEvent) -> bool {
        // Local fast path.
        if self.registry.send_to_client(target_client_id, event.clone()) {
            return true;
        }

        let sessions = match self.storage.sessions_for_client(target_client_id).await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(
                    target = target_client_id,
                    error = %e,
                    "Session lookup failed while routing"
                );
                Vec::new()
            }
        };

        if let Some(session) = live_session(&sessions) {
            if session.node_id == self.node_id {
                // Cache miss — the socket may have rebound since.
                if self.registry.send_to_client(target_client_id, event.clone()) {
                    return true;
                }
            } else {
                self.publish_route(session, event).await;
                return true;
            }
        }

        if self.is_master() {
            return self.master_route(target_client_id, event, &sessions).await;
        }

        // Worker fallback: hand the problem to the master.
        publish_event(
            self.pubsub.as_ref(),
            channels::ROUTING_REQUEST,
            &RoutingRequest {
                target_client_id: target_client_id.to_string(),
                event,
            },
        )
        .await;
        false
    }

    /// Master-side routing: deliver to every live session of the target.
    async fn master_route(
        &self,
        target_client_id: &str,
        event: ServerEvent,
        sessions: &[ClientSession],
    ) -> bool {
        let mut routed = false;
        for session in sessions.iter().filter(|s| s.connected) {
            if session.node_id == self.node_id {
                if self.registry.send_to_socket(&session.socket_id, event.clone())
                    || self.registry.send_to_client(target_client_id, event.clone())
                {
                    routed = true;
                }
            } else {
                self.publish_route(session, event.clone()).await;
                routed = true;
            }
        }

        if !routed {
            tracing::debug!(
                target = target_client_id,
                "No live session found for routed event"
            );
        }
        routed
    }

    async fn publish_route(&self, session: &ClientSession, event: ServerEvent) {
        publish_event(
            self.pubsub.as_ref(),
            channels::MESSAGE_ROUTE,
            &RoutedMessage {
                target_node_id: session.node_id.clone(),
                target_client_id: session.client_id.clone(),
                socket_id: session.socket_id.clone(),
                event,
            },
        )
        .await;
    }

    // ── Subscriptions ─────────────────────────────────────────────────────

    /// Attach the coordinator to the fabric. Spawns one task per channel;
    /// all of them exit on shutdown.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), PubSubError> {
        let mut route_rx = self.pubsub.subscribe(channels::MESSAGE_ROUTE).await?;
        let mut request_rx = self.pubsub.subscribe(channels::ROUTING_REQUEST).await?;
        let mut session_created_rx = self.pubsub.subscribe(channels::SESSION_CREATED).await?;
        let mut session_ended_rx = self.pubsub.subscribe(channels::SESSION_ENDED).await?;
        let mut share_created_rx = self.pubsub.subscribe(channels::SHARE_CREATED).await?;

        let this = self.clone();
        let mut route_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = route_rx.recv() => match message {
                        Some(value) => this.on_routed_message(value),
                        None => break,
                    },
                    _ = route_shutdown.changed() => break,
                }
            }
        });

        let this = self.clone();
        let mut request_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = request_rx.recv() => match message {
                        Some(value) => this.on_routing_request(value).await,
                        None => break,
                    },
                    _ = request_shutdown.changed() => break,
                }
            }
        });

        // Informational channels: every node observes them for logging.
        let mut info_shutdown = shutdown;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = session_created_rx.recv() => match message {
                        Some(value) => tracing::debug!(payload = %value, "session:created"),
                        None => break,
                    },
                    message = session_ended_rx.recv() => match message {
                        Some(value) => tracing::debug!(payload = %value, "session:ended"),
                        None => break,
                    },
                    message = share_created_rx.recv() => match message {
                        Some(value) => tracing::debug!(payload = %value, "share:created"),
                        None => break,
                    },
                    _ = info_shutdown.changed() => break,
                }
            }
        });

        Ok(())
    }

    /// A node consumes only `message:route` entries aimed at it.
    fn on_routed_message(&self, value: serde_json::Value) {
        let routed: RoutedMessage = match serde_json::from_value(value) {
            Ok(routed) => routed,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable message:route payload");
                return;
            }
        };

        if routed.target_node_id != self.node_id {
            return;
        }

        if self.registry.send_to_socket(&routed.socket_id, routed.event.clone()) {
            return;
        }
        // The socket id may be stale after a reconnect; retry by client.
        if self
            .registry
            .send_to_client(&routed.target_client_id, routed.event)
        {
            return;
        }

        tracing::debug!(
            target = routed.target_client_id.as_str(),
            socket = routed.socket_id.as_str(),
            "Dropped routed message, no local socket"
        );
    }

    /// Only the current master acts on `routing:request`. A worker keeps
    /// a short buffer so requests issued during a failover gap are served
    /// once it is promoted.
    async fn on_routing_request(&self, value: serde_json::Value) {
        let request: RoutingRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable routing:request payload");
                return;
            }
        };

        if !self.is_master() {
            let ttl = Duration::from_secs(self.lock_ttl_secs);
            let mut pending = self.pending_requests.lock().unwrap_or_else(|e| e.into_inner());
            pending.retain(|(seen, _)| seen.elapsed() < ttl);
            if pending.len() >= PENDING_REQUEST_CAP {
                pending.remove(0);
            }
            pending.push((Instant::now(), request));
            return;
        }

        let sessions = match self
            .storage
            .sessions_for_client(&request.target_client_id)
            .await
        {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(error = %e, "Master routing lookup failed");
                return;
            }
        };

        self.master_route(&request.target_client_id, request.event, &sessions)
            .await;
    }
}

/// The most recently active connected session, the live socket binding.
fn live_session(sessions: &[ClientSession]) -> Option<&ClientSession> {
    sessions
        .iter()
        .filter(|s| s.connected)
        .max_by_key(|s| s.last_heartbeat)
}
