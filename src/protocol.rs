//! Wire protocol definitions.
//!
//! Clients speak JSON over WebSocket: one object per message, tagged by
//! `event` (kebab-case names, camelCase fields). Cross-node traffic on the
//! pub/sub fabric reuses [`ServerEvent`] inside the channel payload
//! structs. Binary chunk data travels under a tagged base64 wrapper so
//! every payload stays byte-safe end to end.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── Pub/sub channels ──────────────────────────────────────────────────────────

pub mod channels {
    /// A client session was created somewhere in the cluster.
    pub const SESSION_CREATED: &str = "session:created";
    /// A client session ended somewhere in the cluster.
    pub const SESSION_ENDED: &str = "session:ended";
    /// A share session was created somewhere in the cluster.
    pub const SHARE_CREATED: &str = "share:created";
    /// Point-to-point event delivery, filtered by `targetNodeId`.
    pub const MESSAGE_ROUTE: &str = "message:route";
    /// Worker-to-master escalation when direct routing failed.
    pub const ROUTING_REQUEST: &str = "routing:request";
}

// ── Byte-safe blob wrapper ────────────────────────────────────────────────────

/// Raw bytes carried inside JSON payloads.
///
/// Serializes as `{"_base64": "..."}`; accepts either the tagged wrapper
/// or a bare base64 string on the way in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Blob(bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct TaggedBase64 {
    #[serde(rename = "_base64")]
    b64: String,
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TaggedBase64 {
            b64: BASE64.encode(&self.0),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Tagged(TaggedBase64),
            Plain(String),
        }

        let b64 = match Repr::deserialize(deserializer)? {
            Repr::Tagged(tagged) => tagged.b64,
            Repr::Plain(plain) => plain,
        };
        let bytes = BASE64
            .decode(b64.as_bytes())
            .map_err(|e| D::Error::custom(format!("invalid base64 blob: {}", e)))?;
        Ok(Blob(bytes))
    }
}

// ── Client → Server ───────────────────────────────────────────────────────────

/// Events sent from a browser client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Bind this connection to an opaque client id. Must come first.
    Register { client_id: String },

    /// Keepalive; rate limited per client.
    Heartbeat { client_id: String },

    /// Start a new upload to the other share participant.
    UploadInit {
        client_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },

    /// One chunk of file data. The server's `ack` reply is the sender's
    /// flow-control gate.
    UploadChunk {
        client_id: String,
        file_id: String,
        chunk_index: u32,
        chunk: Blob,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<String>,
    },

    /// Receiver-origin acknowledgment of a relayed chunk.
    ChunkAcknowledged {
        client_id: String,
        file_id: String,
        chunk_index: u32,
    },

    /// The receiver finished reassembling the file.
    DownloadConfirmed {
        client_id: String,
        file_id: String,
        file_name: String,
        share_id: String,
    },

    /// Stop receiving chunks for this file.
    CancelDownload { client_id: String, file_id: String },
}

// ── Server → Client ───────────────────────────────────────────────────────────

/// Events sent from the relay to a browser client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Registered {
        node_id: String,
        is_master: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        master_id: Option<String>,
    },

    HeartbeatAck,

    UploadInitResponse {
        file_id: String,
        resume_from: u32,
    },

    /// Sender-side progress after each accepted chunk.
    ChunkUploaded {
        file_id: String,
        chunk_index: u32,
        progress: u32,
        uploaded_chunks: u32,
        total_chunks: u32,
    },

    UploadComplete {
        file_id: String,
        file_name: String,
        file_size: u64,
        /// Milliseconds from init to completion.
        duration: i64,
    },

    /// Announces an incoming transfer to the receiver.
    FileTransferStarted {
        file_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },

    /// One relayed chunk of file data.
    ChunkReceived {
        file_id: String,
        chunk_index: u32,
        chunk: Blob,
        total_chunks: u32,
    },

    ChunkAcknowledged {
        file_id: String,
        chunk_index: u32,
    },

    /// The sender should re-send this chunk.
    ChunkRetry {
        file_id: String,
        chunk_index: u32,
        attempt: u32,
    },

    TransferFailed {
        file_id: String,
        reason: String,
        failed_chunks: Vec<u32>,
    },

    DownloadConfirmed {
        file_id: String,
        file_name: String,
    },

    DownloadCancelled {
        file_id: String,
    },

    ClientJoinedShare {
        client_id: String,
        share_id: String,
    },

    ClientDisconnectedFromShare {
        client_id: String,
        share_id: String,
    },

    ConnectionReady {
        share_id: String,
        connected_clients: u32,
        message: String,
    },

    ClusterRoleChange {
        node_id: String,
        role: String,
        is_master: bool,
    },

    RateLimited {
        reset_at: i64,
    },

    /// Upload admission or transfer-level rejection.
    UploadFailed {
        code: String,
        reason: String,
    },

    /// Reply to an inbound message that carried an `ack` id — the
    /// flow-control signal for `upload-chunk`.
    Ack {
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    Error {
        code: String,
        message: String,
    },
}

// ── Cluster channel payloads ──────────────────────────────────────────────────

/// Payload for `session:created` and `session:ended`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotice {
    pub client_id: String,
    pub node_id: String,
    pub socket_id: String,
}

/// Payload for `share:created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareNotice {
    pub share_id: String,
    pub client_id: String,
    pub node_id: String,
}

/// Payload for `message:route` — consumed only by `target_node_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedMessage {
    pub target_node_id: String,
    pub target_client_id: String,
    pub socket_id: String,
    pub event: ServerEvent,
}

/// Payload for `routing:request` — consumed only by the current master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRequest {
    pub target_client_id: String,
    pub event: ServerEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_serializes_as_tagged_base64() {
        let blob = Blob(vec![0x00, 0xff, 0x10]);
        let json = serde_json::to_string(&blob).unwrap();
        assert!(json.contains("_base64"));

        let back: Blob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn test_blob_accepts_bare_base64_string() {
        let blob: Blob = serde_json::from_str("\"aGVsbG8=\"").unwrap();
        assert_eq!(blob.0, b"hello");
    }

    #[test]
    fn test_blob_rejects_invalid_base64() {
        let result: Result<Blob, _> = serde_json::from_str("\"not base64!!\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_client_event_register_serialization() {
        let msg = ClientEvent::Register {
            client_id: "client-abc".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"event\":\"register\""));
        assert!(json.contains("\"clientId\":\"client-abc\""));

        let parsed: ClientEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientEvent::Register { client_id } => assert_eq!(client_id, "client-abc"),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_event_upload_chunk_serialization() {
        let msg = ClientEvent::UploadChunk {
            client_id: "client-abc".to_string(),
            file_id: "file-1".to_string(),
            chunk_index: 2,
            chunk: Blob(vec![1, 2, 3]),
            checksum: None,
            ack: Some("ack-7".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"event\":\"upload-chunk\""));
        assert!(json.contains("\"chunkIndex\":2"));
        assert!(json.contains("_base64"));
        assert!(!json.contains("checksum"));

        let parsed: ClientEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientEvent::UploadChunk {
                chunk_index, chunk, ack, ..
            } => {
                assert_eq!(chunk_index, 2);
                assert_eq!(chunk.0, vec![1, 2, 3]);
                assert_eq!(ack.as_deref(), Some("ack-7"));
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_server_event_names_are_kebab_case() {
        let cases: Vec<(ServerEvent, &str)> = vec![
            (ServerEvent::HeartbeatAck, "\"event\":\"heartbeat-ack\""),
            (
                ServerEvent::UploadInitResponse {
                    file_id: "f".to_string(),
                    resume_from: 0,
                },
                "\"event\":\"upload-init-response\"",
            ),
            (
                ServerEvent::ClientJoinedShare {
                    client_id: "c".to_string(),
                    share_id: "s".to_string(),
                },
                "\"event\":\"client-joined-share\"",
            ),
            (
                ServerEvent::ClusterRoleChange {
                    node_id: "n".to_string(),
                    role: "master".to_string(),
                    is_master: true,
                },
                "\"event\":\"cluster-role-change\"",
            ),
        ];

        for (event, needle) in cases {
            let json = serde_json::to_string(&event).unwrap();
            assert!(json.contains(needle), "missing {} in {}", needle, json);
        }
    }

    #[test]
    fn test_chunk_received_round_trip() {
        let event = ServerEvent::ChunkReceived {
            file_id: "file-1".to_string(),
            chunk_index: 0,
            chunk: Blob(vec![0u8; 16]),
            total_chunks: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: ServerEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            ServerEvent::ChunkReceived {
                chunk, total_chunks, ..
            } => {
                assert_eq!(chunk.len(), 16);
                assert_eq!(total_chunks, 3);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_all_client_event_variants_round_trip() {
        let messages = vec![
            ClientEvent::Register {
                client_id: "c1".to_string(),
            },
            ClientEvent::Heartbeat {
                client_id: "c1".to_string(),
            },
            ClientEvent::UploadInit {
                client_id: "c1".to_string(),
                file_name: "x".to_string(),
                file_size: 48,
                total_chunks: 3,
            },
            ClientEvent::UploadChunk {
                client_id: "c1".to_string(),
                file_id: "f1".to_string(),
                chunk_index: 0,
                chunk: Blob(vec![9, 9]),
                checksum: Some("ab".to_string()),
                ack: None,
            },
            ClientEvent::ChunkAcknowledged {
                client_id: "c2".to_string(),
                file_id: "f1".to_string(),
                chunk_index: 0,
            },
            ClientEvent::DownloadConfirmed {
                client_id: "c2".to_string(),
                file_id: "f1".to_string(),
                file_name: "x".to_string(),
                share_id: "s1".to_string(),
            },
            ClientEvent::CancelDownload {
                client_id: "c2".to_string(),
                file_id: "f1".to_string(),
            },
        ];

        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: ClientEvent = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2, "Round-trip failed for: {}", json);
        }
    }

    #[test]
    fn test_routed_message_carries_event_intact() {
        let routed = RoutedMessage {
            target_node_id: "node-2".to_string(),
            target_client_id: "bob".to_string(),
            socket_id: "sock-9".to_string(),
            event: ServerEvent::ChunkReceived {
                file_id: "f1".to_string(),
                chunk_index: 1,
                chunk: Blob(vec![7; 8]),
                total_chunks: 3,
            },
        };

        let json = serde_json::to_string(&routed).unwrap();
        assert!(json.contains("\"targetNodeId\":\"node-2\""));
        assert!(json.contains("\"event\":\"chunk-received\""));

        let back: RoutedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.target_node_id, "node-2");
        match back.event {
            ServerEvent::ChunkReceived { chunk, .. } => assert_eq!(chunk.len(), 8),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result: Result<ClientEvent, _> =
            serde_json::from_str("{\"event\":\"mystery-op\",\"clientId\":\"c1\"}");
        assert!(result.is_err());
    }
}
