//! Standalone (single-node) end-to-end flows over the embedded backend.
//!
//! Engines are driven directly with channel receivers standing in for
//! sockets, the same wiring the gateway performs per connection.

use std::sync::Arc;

use tokio::sync::mpsc;

use beamdrop_relay::config::RelayConfig;
use beamdrop_relay::protocol::{Blob, ServerEvent};
use beamdrop_relay::pubsub::memory::MemoryPubSub;
use beamdrop_relay::state::RelayNode;
use beamdrop_relay::storage::memory::MemoryStorage;

async fn standalone_node(config: RelayConfig) -> Arc<RelayNode> {
    RelayNode::new(
        config,
        Arc::new(MemoryStorage::default()),
        Arc::new(MemoryPubSub::new()),
    )
    .await
    .expect("node wiring")
}

async fn connect(node: &Arc<RelayNode>, client_id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let socket_id = format!("sock-{}", client_id);
    node.registry.bind(client_id, &socket_id, tx);
    node.sessions.register(client_id, &socket_id).await;
    rx
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn standalone_happy_path() {
    let node = standalone_node(RelayConfig::default()).await;

    // A registers and creates a share; B joins it.
    let mut alice_rx = connect(&node, "client-a").await;
    let mut bob_rx = connect(&node, "client-b").await;

    let share = node
        .sessions
        .create_share("client-a", Some("share-s".to_string()))
        .await
        .unwrap();
    node.sessions
        .join_share(&share.share_id, "client-b")
        .await
        .unwrap();
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    // A initiates the upload: 48 bytes in 3 chunks.
    let (file_id, _) = node
        .transfers
        .init_upload("client-a", "x", 48, 3)
        .await
        .unwrap();

    let bob_events = drain(&mut bob_rx);
    assert!(bob_events.iter().any(|e| matches!(
        e,
        ServerEvent::FileTransferStarted { file_name, file_size: 48, total_chunks: 3, .. }
            if file_name == "x"
    )));

    // A streams the three chunks.
    for index in 0..3u32 {
        node.transfers
            .handle_chunk("client-a", &file_id, index, &Blob(vec![index as u8; 16]), None)
            .await
            .unwrap();
    }

    // B receives them in order 0, 1, 2.
    let received: Vec<u32> = drain(&mut bob_rx)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::ChunkReceived {
                chunk_index,
                total_chunks: 3,
                ..
            } => Some(chunk_index),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![0, 1, 2]);

    // A observes progress 33/66/100, three ACKs, then completion.
    let alice_events = drain(&mut alice_rx);
    let progress: Vec<u32> = alice_events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::ChunkUploaded { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![33, 66, 100]);
    assert_eq!(
        alice_events
            .iter()
            .filter(|e| matches!(e, ServerEvent::ChunkAcknowledged { .. }))
            .count(),
        3
    );
    assert!(alice_events.iter().any(|e| matches!(
        e,
        ServerEvent::UploadComplete { file_name, file_size: 48, .. } if file_name == "x"
    )));

    // B confirms reassembly and A hears about it.
    node.transfers
        .confirm_download("client-b", &file_id, "x", &share.share_id)
        .await;
    assert!(drain(&mut alice_rx).iter().any(|e| matches!(
        e,
        ServerEvent::DownloadConfirmed { file_name, .. } if file_name == "x"
    )));
}

#[tokio::test]
async fn share_full_rejects_third_client() {
    let node = standalone_node(RelayConfig::default()).await;

    let mut c1_rx = connect(&node, "c1").await;
    let mut c2_rx = connect(&node, "c2").await;
    let mut _c3_rx = connect(&node, "c3").await;

    node.sessions
        .create_share("c1", Some("share-s".to_string()))
        .await
        .unwrap();
    node.sessions.join_share("share-s", "c2").await.unwrap();

    let err = node.sessions.join_share("share-s", "c3").await.unwrap_err();
    assert_eq!(err.wire_code(), "SHARE_SESSION_FULL");

    // C1 and C2 each observed exactly one join notice, for the other.
    let c1_joins: Vec<String> = drain(&mut c1_rx)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::ClientJoinedShare { client_id, .. } => Some(client_id),
            _ => None,
        })
        .collect();
    assert_eq!(c1_joins, vec!["c2".to_string()]);

    let c2_joins: Vec<String> = drain(&mut c2_rx)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::ClientJoinedShare { client_id, .. } => Some(client_id),
            _ => None,
        })
        .collect();
    assert_eq!(c2_joins, vec!["c1".to_string()]);
}

#[tokio::test]
async fn file_size_boundary() {
    let config = RelayConfig::default();
    let max = config.max_file_size;
    let node = standalone_node(config).await;
    connect(&node, "client-a").await;

    // Exactly at the limit: accepted.
    assert!(node
        .transfers
        .init_upload("client-a", "exact.bin", max, 1)
        .await
        .is_ok());

    // One byte over: rejected with the file-too-large code.
    let err = node
        .transfers
        .init_upload("client-a", "over.bin", max + 1, 1)
        .await
        .unwrap_err();
    assert_eq!(err.wire_code(), "FILE_TOO_LARGE");
}

#[tokio::test]
async fn heartbeat_flood_is_rate_limited() {
    let node = standalone_node(RelayConfig {
        heartbeat_limit: 5,
        ..RelayConfig::default()
    })
    .await;
    let mut rx = connect(&node, "client-a").await;
    drain(&mut rx);

    for _ in 0..5 {
        node.sessions.heartbeat("client-a", "sock-client-a").await;
    }
    let acks = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::HeartbeatAck))
        .count();
    assert_eq!(acks, 5);

    node.sessions.heartbeat("client-a", "sock-client-a").await;
    let reset_at = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            ServerEvent::RateLimited { reset_at } => Some(reset_at),
            _ => None,
        })
        .expect("expected rate limiting");
    assert!(reset_at > chrono::Utc::now().timestamp() - 1);
    assert!(reset_at <= chrono::Utc::now().timestamp() + 61);
}

#[tokio::test]
async fn single_master_in_standalone_mode() {
    let node = standalone_node(RelayConfig::default()).await;
    node.coordinator.election_tick().await;
    assert!(node.coordinator.is_master());
    assert_eq!(
        node.coordinator.master_id().await.as_deref(),
        Some(node.node_id())
    );
}
