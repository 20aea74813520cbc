//! WebSocket gateway.
//!
//! Manages individual client connections: the registration-first
//! handshake, parsing inbound events, dispatching them into the session
//! and transfer engines, and the per-connection outbound queue that keeps
//! the client's event stream FIFO.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ClientEvent, ServerEvent};
use crate::state::RelayNode;

/// A connected client's outbound channel.
pub type ClientSender = mpsc::UnboundedSender<ServerEvent>;

/// The node-local socket table: the routing fast path and the fallback
/// for stale socket ids after a reconnect.
#[derive(Clone, Default)]
pub struct SocketRegistry {
    by_socket: Arc<DashMap<String, ClientSender>>,
    client_sockets: Arc<DashMap<String, String>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a socket to a client. A reconnecting client takes over the
    /// live binding; the old socket keeps draining until it closes.
    pub fn bind(&self, client_id: &str, socket_id: &str, sender: ClientSender) {
        self.by_socket.insert(socket_id.to_string(), sender);
        self.client_sockets
            .insert(client_id.to_string(), socket_id.to_string());
    }

    pub fn unbind(&self, socket_id: &str) {
        self.by_socket.remove(socket_id);
        self.client_sockets.retain(|_, bound| bound != socket_id);
    }

    pub fn send_to_socket(&self, socket_id: &str, event: ServerEvent) -> bool {
        self.by_socket
            .get(socket_id)
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    pub fn send_to_client(&self, client_id: &str, event: ServerEvent) -> bool {
        let socket_id = match self.client_sockets.get(client_id) {
            Some(socket_id) => socket_id.clone(),
            None => return false,
        };
        self.send_to_socket(&socket_id, event)
    }

    /// Best-effort delivery to every locally connected socket.
    pub fn broadcast_local(&self, event: ServerEvent) {
        for entry in self.by_socket.iter() {
            let _ = entry.value().send(event.clone());
        }
    }

    pub fn online_count(&self) -> usize {
        self.by_socket.len()
    }
}

/// Handle one WebSocket connection for its whole lifetime.
///
/// 1. Wait for a `register` event to bind the connection to a client id
/// 2. Spawn the sender task that drains the outbound queue
/// 3. Dispatch events until the connection closes
/// 4. Tear the session down
pub async fn handle_socket(socket: WebSocket, node: Arc<RelayNode>) {
    let socket_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Registration first ────────────────────────────────────────────────

    let client_id = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(ClientEvent::Register { client_id }) => {
                    if client_id.is_empty() {
                        send_direct(
                            &mut ws_sender,
                            &ServerEvent::Error {
                                code: "BAD_REQUEST".to_string(),
                                message: "clientId must not be empty".to_string(),
                            },
                        )
                        .await;
                        continue;
                    }
                    break client_id;
                }
                Ok(_) => {
                    send_direct(
                        &mut ws_sender,
                        &ServerEvent::Error {
                            code: "BAD_REQUEST".to_string(),
                            message: "Must register before sending other events".to_string(),
                        },
                    )
                    .await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse client event");
                    send_direct(
                        &mut ws_sender,
                        &ServerEvent::Error {
                            code: "BAD_REQUEST".to_string(),
                            message: format!("Invalid event format: {}", e),
                        },
                    )
                    .await;
                }
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return; // Closed before registration.
            }
            _ => continue,
        }
    };

    // ── Bind the socket, then spawn the outbound drain ────────────────────

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    node.registry.bind(&client_id, &socket_id, tx);

    let sender_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed.
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize server event");
                }
            }
        }
    });

    node.sessions.register(&client_id, &socket_id).await;
    tracing::info!(
        client = client_id.as_str(),
        socket = socket_id.as_str(),
        "WebSocket registered"
    );

    // ── Event loop ────────────────────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => {
                    dispatch_event(&node, &client_id, &socket_id, event).await;
                }
                Err(e) => {
                    tracing::warn!(
                        client = client_id.as_str(),
                        error = %e,
                        "Rejected unparseable event"
                    );
                    node.registry.send_to_socket(
                        &socket_id,
                        ServerEvent::Error {
                            code: "BAD_REQUEST".to_string(),
                            message: format!("Invalid event format: {}", e),
                        },
                    );
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!(client = client_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(client = client_id.as_str(), error = %e, "WebSocket error");
                break;
            }
            _ => {} // Binary, Ping, Pong — axum answers pings itself.
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    node.sessions.disconnect(&client_id, &socket_id).await;
    node.registry.unbind(&socket_id);
    sender_task.abort();
    tracing::info!(client = client_id.as_str(), "WebSocket disconnected");
}

async fn send_direct(
    ws_sender: &mut (impl SinkExt<Message> + Unpin),
    event: &ServerEvent,
) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = ws_sender.send(Message::Text(json)).await;
    }
}

/// Dispatch a parsed event. The bound `client_id` is authoritative; the
/// ids inside payloads only matter for cross-client references.
async fn dispatch_event(node: &Arc<RelayNode>, client_id: &str, socket_id: &str, event: ClientEvent) {
    match event {
        ClientEvent::Register { .. } => {
            node.registry.send_to_socket(
                socket_id,
                ServerEvent::Error {
                    code: "BAD_REQUEST".to_string(),
                    message: "Already registered".to_string(),
                },
            );
        }

        ClientEvent::Heartbeat { .. } => {
            node.sessions.heartbeat(client_id, socket_id).await;
        }

        ClientEvent::UploadInit {
            file_name,
            file_size,
            total_chunks,
            ..
        } => {
            match node
                .transfers
                .init_upload(client_id, &file_name, file_size, total_chunks)
                .await
            {
                Ok((file_id, resume_from)) => {
                    node.registry.send_to_socket(
                        socket_id,
                        ServerEvent::UploadInitResponse {
                            file_id,
                            resume_from,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(client = client_id, error = %e, "Upload init rejected");
                    node.registry.send_to_socket(
                        socket_id,
                        ServerEvent::UploadFailed {
                            code: e.wire_code().to_string(),
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }

        ClientEvent::UploadChunk {
            file_id,
            chunk_index,
            chunk,
            checksum,
            ack,
            ..
        } => {
            let result = node
                .transfers
                .handle_chunk(client_id, &file_id, chunk_index, &chunk, checksum.as_deref())
                .await;

            // The reply is the sender's flow-control gate: it must go out
            // as soon as relay + persist are done.
            match (ack, result) {
                (Some(id), Ok(())) => {
                    node.registry.send_to_socket(
                        socket_id,
                        ServerEvent::Ack {
                            id,
                            success: true,
                            error: None,
                        },
                    );
                }
                (Some(id), Err(e)) => {
                    node.registry.send_to_socket(
                        socket_id,
                        ServerEvent::Ack {
                            id,
                            success: false,
                            error: Some(e.wire_code().to_string()),
                        },
                    );
                }
                (None, Ok(())) => {}
                (None, Err(e)) => {
                    node.registry.send_to_socket(
                        socket_id,
                        ServerEvent::Error {
                            code: e.wire_code().to_string(),
                            message: e.to_string(),
                        },
                    );
                }
            }
        }

        ClientEvent::ChunkAcknowledged {
            file_id,
            chunk_index,
            ..
        } => {
            node.transfers.handle_receiver_ack(&file_id, chunk_index).await;
        }

        ClientEvent::DownloadConfirmed {
            file_id,
            file_name,
            share_id,
            ..
        } => {
            node.transfers
                .confirm_download(client_id, &file_id, &file_name, &share_id)
                .await;
        }

        ClientEvent::CancelDownload { file_id, .. } => {
            node.transfers.cancel_download(client_id, &file_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_send() {
        let registry = SocketRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.bind("alice", "sock-1", tx);

        assert!(registry.send_to_socket("sock-1", ServerEvent::HeartbeatAck));
        assert!(registry.send_to_client("alice", ServerEvent::HeartbeatAck));
        assert_eq!(registry.online_count(), 1);

        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::HeartbeatAck));
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::HeartbeatAck));
    }

    #[test]
    fn test_unbind_clears_both_tables() {
        let registry = SocketRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.bind("alice", "sock-1", tx);

        registry.unbind("sock-1");
        assert!(!registry.send_to_socket("sock-1", ServerEvent::HeartbeatAck));
        assert!(!registry.send_to_client("alice", ServerEvent::HeartbeatAck));
        assert_eq!(registry.online_count(), 0);
    }

    #[test]
    fn test_reconnect_takes_over_client_binding() {
        let registry = SocketRegistry::new();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();

        registry.bind("alice", "sock-old", old_tx);
        registry.bind("alice", "sock-new", new_tx);

        assert!(registry.send_to_client("alice", ServerEvent::HeartbeatAck));
        assert!(new_rx.try_recv().is_ok());
        assert!(old_rx.try_recv().is_err());

        // Closing the old socket must not disturb the new binding.
        registry.unbind("sock-old");
        assert!(registry.send_to_client("alice", ServerEvent::HeartbeatAck));
    }

    #[test]
    fn test_broadcast_reaches_all_sockets() {
        let registry = SocketRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.bind("alice", "sock-1", tx1);
        registry.bind("bob", "sock-2", tx2);

        registry.broadcast_local(ServerEvent::HeartbeatAck);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
