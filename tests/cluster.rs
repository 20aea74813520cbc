//! Cross-node flows: two relay nodes over one shared store and fabric.
//!
//! The in-memory backends are cloned into both nodes, which is exactly
//! the cluster topology minus the sockets — peers of one share land on
//! different nodes and every event between them crosses `message:route`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use beamdrop_relay::config::RelayConfig;
use beamdrop_relay::protocol::{channels, Blob, RoutedMessage, ServerEvent};
use beamdrop_relay::pubsub::memory::MemoryPubSub;
use beamdrop_relay::pubsub::PubSub;
use beamdrop_relay::state::RelayNode;
use beamdrop_relay::storage::memory::MemoryStorage;
use beamdrop_relay::storage::Storage;

struct Cluster {
    storage: MemoryStorage,
    fabric: MemoryPubSub,
    _shutdown: watch::Sender<bool>,
}

impl Cluster {
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            storage: MemoryStorage::default(),
            fabric: MemoryPubSub::new(),
            _shutdown: shutdown,
        }
    }

    /// A wired node that is not yet attached to the fabric.
    async fn offline_node(&self, port: u16, config: RelayConfig) -> Arc<RelayNode> {
        RelayNode::new(
            RelayConfig {
                port,
                use_cluster: true,
                ..config
            },
            Arc::new(self.storage.clone()),
            Arc::new(self.fabric.clone()),
        )
        .await
        .expect("node wiring")
    }

    async fn node(&self, port: u16, config: RelayConfig) -> Arc<RelayNode> {
        let node = self.offline_node(port, config).await;
        node.start(self._shutdown.subscribe()).await.expect("subscriptions");
        node
    }
}

async fn connect(node: &Arc<RelayNode>, client_id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let socket_id = format!("sock-{}", client_id);
    node.registry.bind(client_id, &socket_id, tx);
    node.sessions.register(client_id, &socket_id).await;
    rx
}

/// Receive events until `want` matches, with a timeout. Non-matching
/// events are collected and returned alongside the match.
async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<ServerEvent>, mut want: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("channel closed");
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn two_node_cross_routing() {
    let cluster = Cluster::new();
    let n1 = cluster.node(3001, RelayConfig::default()).await;
    let n2 = cluster.node(3002, RelayConfig::default()).await;
    assert_ne!(n1.node_id(), n2.node_id());

    // Tap the routing channel to verify cross-node delivery paths.
    let mut route_tap = cluster.fabric.subscribe(channels::MESSAGE_ROUTE).await.unwrap();

    // A on node 1, B on node 2.
    let mut alice_rx = connect(&n1, "client-a").await;
    let mut bob_rx = connect(&n2, "client-b").await;

    let share = n1
        .sessions
        .create_share("client-a", Some("share-s".to_string()))
        .await
        .unwrap();
    n2.sessions.join_share(&share.share_id, "client-b").await.unwrap();

    // Join notices cross the fabric in both directions.
    wait_for(&mut alice_rx, |e| {
        matches!(e, ServerEvent::ClientJoinedShare { client_id, .. } if client_id == "client-b")
    })
    .await;
    wait_for(&mut bob_rx, |e| {
        matches!(e, ServerEvent::ClientJoinedShare { client_id, .. } if client_id == "client-a")
    })
    .await;

    // Upload three chunks from A; they reach B on the other node.
    let (file_id, _) = n1
        .transfers
        .init_upload("client-a", "x", 48, 3)
        .await
        .unwrap();
    wait_for(&mut bob_rx, |e| {
        matches!(e, ServerEvent::FileTransferStarted { .. })
    })
    .await;

    for index in 0..3u32 {
        n1.transfers
            .handle_chunk("client-a", &file_id, index, &Blob(vec![index as u8; 16]), None)
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 3 {
        let event = wait_for(&mut bob_rx, |e| {
            matches!(e, ServerEvent::ChunkReceived { .. })
        })
        .await;
        if let ServerEvent::ChunkReceived { chunk_index, .. } = event {
            received.push(chunk_index);
        }
    }
    assert_eq!(received, vec![0, 1, 2]);

    // A saw its acknowledgments and the completion.
    wait_for(&mut alice_rx, |e| {
        matches!(e, ServerEvent::UploadComplete { .. })
    })
    .await;

    // Every chunk-received to B went over message:route aimed at node 2.
    let mut chunk_routes = 0;
    while let Ok(value) = route_tap.try_recv() {
        let routed: RoutedMessage = serde_json::from_value(value).unwrap();
        if matches!(routed.event, ServerEvent::ChunkReceived { .. }) {
            assert_eq!(routed.target_node_id, n2.node_id());
            assert_eq!(routed.target_client_id, "client-b");
            chunk_routes += 1;
        }
    }
    assert_eq!(chunk_routes, 3);

    // B's confirmation crosses back to A.
    n2.transfers
        .confirm_download("client-b", &file_id, "x", &share.share_id)
        .await;
    wait_for(&mut alice_rx, |e| {
        matches!(e, ServerEvent::DownloadConfirmed { .. })
    })
    .await;
}

#[tokio::test]
async fn leader_failover_promotes_surviving_node() {
    let cluster = Cluster::new();
    // Short lease so the failover window fits in a test.
    let config = RelayConfig {
        master_lock_ttl_secs: 1,
        election_interval_secs: 1,
        ..RelayConfig::default()
    };
    // Node 1 never attaches to the fabric: after its abrupt death below
    // there must be nobody left serving its subscriptions.
    let n1 = cluster.offline_node(3001, config.clone()).await;
    let n2 = cluster.node(3002, config).await;

    n1.coordinator.election_tick().await;
    n2.coordinator.election_tick().await;
    assert!(n1.coordinator.is_master());
    assert!(!n2.coordinator.is_master());

    // A client connected to the surviving node.
    let mut bob_rx = connect(&n2, "client-b").await;
    drain(&mut bob_rx);

    // Node 1 dies abruptly: it never refreshes its lease again. A worker
    // escalation issued during the gap has no master to serve it yet.
    cluster
        .fabric
        .publish(
            channels::ROUTING_REQUEST,
            &serde_json::json!({
                "targetClientId": "client-b",
                "event": { "event": "heartbeat-ack" },
            }),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain(&mut bob_rx).is_empty());

    // Within one lease the survivor takes over.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    n2.coordinator.election_tick().await;
    assert!(n2.coordinator.is_master());
    assert_eq!(
        n2.coordinator.master_id().await.as_deref(),
        Some(n2.node_id())
    );

    // Promotion was announced locally and the gap-era escalation was
    // finally delivered.
    let events = drain(&mut bob_rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::ClusterRoleChange { is_master: true, .. }
    )));
    assert!(events.iter().any(|e| matches!(e, ServerEvent::HeartbeatAck)));
}

#[tokio::test]
async fn master_observability_endpoints_agree() {
    let cluster = Cluster::new();
    let n1 = cluster.node(3001, RelayConfig::default()).await;
    let n2 = cluster.node(3002, RelayConfig::default()).await;

    n1.coordinator.election_tick().await;
    n2.coordinator.election_tick().await;

    // Both nodes agree on who the master is.
    assert_eq!(
        n1.coordinator.master_id().await,
        n2.coordinator.master_id().await
    );
    assert_eq!(
        n1.coordinator.master_id().await.as_deref(),
        Some(n1.node_id())
    );
}

#[tokio::test]
async fn session_visible_across_nodes() {
    let cluster = Cluster::new();
    let n1 = cluster.node(3001, RelayConfig::default()).await;
    let n2 = cluster.node(3002, RelayConfig::default()).await;

    let mut _alice_rx = connect(&n1, "client-a").await;

    // Node 2 can resolve the session registered on node 1.
    let sessions = cluster.storage.sessions_for_client("client-a").await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].node_id, n1.node_id());

    // And routing from node 2 reaches the client on node 1.
    let routed = n2
        .coordinator
        .route_to_client("client-a", ServerEvent::HeartbeatAck)
        .await;
    assert!(routed);
}
