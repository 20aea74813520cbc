//! Persisted entity types.
//!
//! Everything here round-trips through the storage layer as JSON. Set- and
//! map-valued fields use ordered collections so serialized records are
//! deterministic and membership survives the round-trip.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum participants per share session.
pub const MAX_SHARE_CLIENTS: usize = 2;

// ── Nodes ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Dead,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Worker => "worker",
        }
    }
}

/// A relay process registered in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    pub status: NodeStatus,
    pub role: NodeRole,
    pub last_heartbeat: DateTime<Utc>,
}

impl Node {
    pub fn new(id: String, hostname: String, port: u16) -> Self {
        Self {
            id,
            hostname,
            port,
            status: NodeStatus::Active,
            role: NodeRole::Worker,
            last_heartbeat: Utc::now(),
        }
    }
}

// ── Client sessions ───────────────────────────────────────────────────────────

/// One client's registration on one socket.
///
/// `(client_id, socket_id)` is unique; a reconnecting client creates a new
/// session and the most recent socket is the live binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSession {
    pub client_id: String,
    pub socket_id: String,
    pub node_id: String,
    pub connected: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub uploads: BTreeSet<String>,
    pub downloads: BTreeSet<String>,
    pub upload_speed: f64,
    pub download_speed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
}

impl ClientSession {
    pub fn new(client_id: String, socket_id: String, node_id: String) -> Self {
        Self {
            client_id,
            socket_id,
            node_id,
            connected: true,
            last_heartbeat: Utc::now(),
            uploads: BTreeSet::new(),
            downloads: BTreeSet::new(),
            upload_speed: 0.0,
            download_speed: 0.0,
            share_id: None,
        }
    }

    /// Combined transfer count used by the admission checks.
    pub fn transfer_count(&self) -> usize {
        self.uploads.len() + self.downloads.len()
    }
}

// ── Share sessions ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareStatus {
    Active,
    Inactive,
}

/// A two-participant rendezvous room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareSession {
    pub share_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Ordered join list, capped at [`MAX_SHARE_CLIENTS`].
    pub clients: Vec<String>,
    pub status: ShareStatus,
}

impl ShareSession {
    pub fn new(share_id: String, creator: String) -> Self {
        let now = Utc::now();
        Self {
            share_id,
            created_at: now,
            last_activity: now,
            clients: vec![creator],
            status: ShareStatus::Active,
        }
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= MAX_SHARE_CLIENTS
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.iter().any(|c| c == client_id)
    }

    /// The other participants from `client_id`'s point of view.
    pub fn peers_of(&self, client_id: &str) -> Vec<String> {
        self.clients
            .iter()
            .filter(|c| c.as_str() != client_id)
            .cloned()
            .collect()
    }
}

// ── Uploads ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    /// Terminal uploads take no further chunks and leave the ACK scan.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }
}

/// A chunk that was relayed but not yet acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAck {
    /// Epoch milliseconds of the last (re)send.
    pub timestamp: i64,
    pub retries: u32,
}

/// Per-upload transfer state, the record the chunk handler and the ACK
/// scanner contend over. Mutation is serialized per `file_id` by the
/// transfer engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadState {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub uploaded_chunks: BTreeSet<u32>,
    /// Sender client id.
    pub client_id: String,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chunk_checksums: BTreeMap<u32, String>,
    #[serde(default)]
    pub pending_acks: BTreeMap<u32, PendingAck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ack_time: Option<i64>,
}

impl UploadState {
    pub fn new(
        file_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
        client_id: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            file_id,
            file_name,
            file_size,
            total_chunks,
            uploaded_chunks: BTreeSet::new(),
            client_id,
            start_time: now,
            last_update: now,
            status: UploadStatus::Uploading,
            chunk_checksums: BTreeMap::new(),
            pending_acks: BTreeMap::new(),
            last_ack_time: None,
        }
    }

    /// Record a chunk arrival. Returns true when the index is fresh.
    pub fn record_chunk(&mut self, chunk_index: u32) -> bool {
        self.last_update = Utc::now();
        self.uploaded_chunks.insert(chunk_index)
    }

    pub fn all_chunks_uploaded(&self) -> bool {
        self.uploaded_chunks.len() as u32 >= self.total_chunks
    }

    /// Integer percentage of chunks received.
    pub fn progress_percent(&self) -> u32 {
        if self.total_chunks == 0 {
            return 100;
        }
        (self.uploaded_chunks.len() as u64 * 100 / self.total_chunks as u64) as u32
    }

    /// Count of contiguous leading chunks already present — where a
    /// resuming sender may continue from.
    pub fn resume_from(&self) -> u32 {
        let mut next = 0u32;
        for index in &self.uploaded_chunks {
            if *index == next {
                next += 1;
            } else {
                break;
            }
        }
        next
    }
}

// ── Rate limiting ─────────────────────────────────────────────────────────────

/// Outcome of a fixed-window rate check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// Epoch seconds when the window resets.
    pub reset_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_roster_cap() {
        let mut share = ShareSession::new("share-1".to_string(), "alice".to_string());
        assert!(!share.is_full());
        share.clients.push("bob".to_string());
        assert!(share.is_full());
        assert_eq!(share.peers_of("alice"), vec!["bob".to_string()]);
        assert_eq!(share.peers_of("carol").len(), 2);
    }

    #[test]
    fn test_upload_chunk_recording_is_idempotent() {
        let mut upload = UploadState::new(
            "file-1".to_string(),
            "x".to_string(),
            48,
            3,
            "alice".to_string(),
        );
        assert!(upload.record_chunk(0));
        assert!(!upload.record_chunk(0));
        assert_eq!(upload.uploaded_chunks.len(), 1);
        assert_eq!(upload.progress_percent(), 33);

        upload.record_chunk(1);
        upload.record_chunk(2);
        assert!(upload.all_chunks_uploaded());
        assert_eq!(upload.progress_percent(), 100);
    }

    #[test]
    fn test_resume_from_counts_contiguous_prefix() {
        let mut upload = UploadState::new(
            "file-1".to_string(),
            "x".to_string(),
            64,
            4,
            "alice".to_string(),
        );
        assert_eq!(upload.resume_from(), 0);
        upload.record_chunk(0);
        upload.record_chunk(1);
        upload.record_chunk(3);
        assert_eq!(upload.resume_from(), 2);
    }

    #[test]
    fn test_upload_state_round_trips_membership() {
        let mut upload = UploadState::new(
            "file-1".to_string(),
            "report.pdf".to_string(),
            1024,
            4,
            "alice".to_string(),
        );
        upload.record_chunk(2);
        upload.pending_acks.insert(
            2,
            PendingAck {
                timestamp: 1_700_000_000_000,
                retries: 1,
            },
        );
        upload
            .chunk_checksums
            .insert(2, "deadbeef".to_string());

        let json = serde_json::to_string(&upload).unwrap();
        let back: UploadState = serde_json::from_str(&json).unwrap();
        assert!(back.uploaded_chunks.contains(&2));
        assert_eq!(back.pending_acks.get(&2).unwrap().retries, 1);
        assert_eq!(back.chunk_checksums.get(&2).unwrap(), "deadbeef");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!UploadStatus::Uploading.is_terminal());
        assert!(!UploadStatus::Paused.is_terminal());
        assert!(UploadStatus::Completed.is_terminal());
        assert!(UploadStatus::Failed.is_terminal());
        assert!(UploadStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_session_transfer_count() {
        let mut session = ClientSession::new(
            "alice".to_string(),
            "sock-1".to_string(),
            "node-1".to_string(),
        );
        session.uploads.insert("f1".to_string());
        session.downloads.insert("f2".to_string());
        session.downloads.insert("f3".to_string());
        assert_eq!(session.transfer_count(), 3);
    }
}
