//! Unified storage over the relay's persisted entities.
//!
//! Two backends share one contract: the embedded in-process store
//! ([`memory::MemoryStorage`]) and the redis-backed store
//! ([`redis_store::RedisStorage`]) required for cluster mode. Callers hold
//! an `Arc<dyn Storage>` and never know which one they got.
//!
//! Failure policy: callers on hot paths log write errors and continue —
//! the ACK/retry machinery absorbs a lost write. A missing key and a null
//! are indistinguishable on the read path.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{ClientSession, Node, RateLimitDecision, ShareSession, UploadState};

/// Key for the cluster leader lock.
pub const MASTER_LOCK_KEY: &str = "cluster:master";

/// TTLs applied by the backends, lifted from the relay configuration.
#[derive(Debug, Clone, Copy)]
pub struct TtlSettings {
    pub client_session_secs: u64,
    pub share_session_secs: u64,
    pub upload_state_secs: u64,
}

impl Default for TtlSettings {
    fn default() -> Self {
        Self {
            client_session_secs: crate::config::DEFAULT_TTL_CLIENT_SESSION_SECS,
            share_session_secs: crate::config::DEFAULT_TTL_SHARE_SESSION_SECS,
            upload_state_secs: crate::config::DEFAULT_TTL_UPLOAD_STATE_SECS,
        }
    }
}

impl TtlSettings {
    pub fn from_config(config: &crate::config::RelayConfig) -> Self {
        Self {
            client_session_secs: config.ttl_client_session_secs,
            share_session_secs: config.ttl_share_session_secs,
            upload_state_secs: config.ttl_upload_state_secs,
        }
    }
}

/// The storage contract shared by both backends.
#[async_trait]
pub trait Storage: Send + Sync {
    // ── Nodes ────────────────────────────────────────────────────────────

    async fn put_node(&self, node: &Node) -> Result<(), StorageError>;

    async fn get_node(&self, node_id: &str) -> Result<Option<Node>, StorageError>;

    /// Look up a node by its listen address, for id reuse across restarts.
    async fn find_node_by_addr(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<Option<Node>, StorageError>;

    async fn list_nodes(&self) -> Result<Vec<Node>, StorageError>;

    // ── Client sessions ──────────────────────────────────────────────────

    /// Write a session under its `(client_id, socket_id)` key with the
    /// client-session TTL.
    async fn put_session(&self, session: &ClientSession) -> Result<(), StorageError>;

    async fn get_session(
        &self,
        client_id: &str,
        socket_id: &str,
    ) -> Result<Option<ClientSession>, StorageError>;

    /// All sessions of one client (reconnects leave several).
    async fn sessions_for_client(
        &self,
        client_id: &str,
    ) -> Result<Vec<ClientSession>, StorageError>;

    async fn count_connected_sessions(&self) -> Result<u64, StorageError>;

    /// Flip `connected=false` on every session bound to a node. Returns
    /// the number of sessions touched.
    async fn deactivate_sessions_on_node(&self, node_id: &str) -> Result<u64, StorageError>;

    // ── Share sessions ───────────────────────────────────────────────────

    /// Create a share; returns false when the id already exists.
    async fn create_share(&self, share: &ShareSession) -> Result<bool, StorageError>;

    async fn get_share(&self, share_id: &str) -> Result<Option<ShareSession>, StorageError>;

    async fn put_share(&self, share: &ShareSession) -> Result<(), StorageError>;

    async fn remove_share(&self, share_id: &str) -> Result<(), StorageError>;

    // ── Uploads ──────────────────────────────────────────────────────────

    /// Atomic whole-record write. Keeps the active-upload index in step
    /// with the record's status.
    async fn put_upload(&self, state: &UploadState) -> Result<(), StorageError>;

    async fn get_upload(&self, file_id: &str) -> Result<Option<UploadState>, StorageError>;

    async fn remove_upload(&self, file_id: &str) -> Result<(), StorageError>;

    /// Ids of uploads still in a non-terminal status, for the ACK scan.
    async fn active_upload_ids(&self) -> Result<Vec<String>, StorageError>;

    /// Every stored upload id, for the reaper.
    async fn all_upload_ids(&self) -> Result<Vec<String>, StorageError>;

    // ── Cancelled downloads ──────────────────────────────────────────────

    /// Idempotent set insert; the mark expires with the upload TTL.
    async fn add_cancelled_download(
        &self,
        file_id: &str,
        client_id: &str,
    ) -> Result<(), StorageError>;

    async fn is_download_cancelled(
        &self,
        file_id: &str,
        client_id: &str,
    ) -> Result<bool, StorageError>;

    async fn clear_cancelled(&self, file_id: &str) -> Result<(), StorageError>;

    // ── Rate limiting ────────────────────────────────────────────────────

    /// Fixed-window counter. The first increment in a window sets its
    /// expiry.
    async fn check_rate_limit(
        &self,
        key: &str,
        max: u64,
        window_secs: u64,
    ) -> Result<RateLimitDecision, StorageError>;

    // ── Leader lock ──────────────────────────────────────────────────────

    /// Atomic set-if-not-exists with TTL on [`MASTER_LOCK_KEY`].
    async fn try_acquire_master_lock(
        &self,
        node_id: &str,
        ttl_secs: u64,
    ) -> Result<bool, StorageError>;

    /// Extend the lease when `node_id` already holds it.
    async fn refresh_master_lock(
        &self,
        node_id: &str,
        ttl_secs: u64,
    ) -> Result<bool, StorageError>;

    async fn current_master(&self) -> Result<Option<String>, StorageError>;

    // ── Counters ─────────────────────────────────────────────────────────

    async fn incr_counter(&self, name: &str) -> Result<u64, StorageError>;

    async fn get_counter(&self, name: &str) -> Result<u64, StorageError>;

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Drop expired entries. The redis backend relies on key TTLs and
    /// treats this as a no-op.
    async fn sweep_expired(&self) -> Result<(), StorageError>;
}

pub(crate) fn session_key(client_id: &str, socket_id: &str) -> String {
    format!("session:{}:{}", client_id, socket_id)
}

pub(crate) fn node_key(node_id: &str) -> String {
    format!("node:{}", node_id)
}

pub(crate) fn share_key(share_id: &str) -> String {
    format!("share:{}", share_id)
}

pub(crate) fn upload_key(file_id: &str) -> String {
    format!("upload:{}", file_id)
}

pub(crate) fn cancelled_key(file_id: &str) -> String {
    format!("cancelled:{}", file_id)
}

pub(crate) fn rate_key(key: &str) -> String {
    format!("rate:{}", key)
}

pub(crate) fn counter_key(name: &str) -> String {
    format!("stats:{}", name)
}
