//! Embedded storage backend.
//!
//! In-process maps with per-entry expiry timestamps, checked on access and
//! swept by the periodic cleanup loop. Cloning the handle shares the
//! underlying maps, so one store can back several engines in one process.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{session_key, Storage, TtlSettings};
use crate::error::StorageError;
use crate::model::{ClientSession, Node, RateLimitDecision, ShareSession, UploadState};

/// A stored value with an optional expiry timestamp (epoch seconds).
#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Option<i64>,
}

impl<T> Expiring<T> {
    fn with_ttl(value: T, ttl_secs: u64) -> Self {
        Self {
            value,
            expires_at: Some(Utc::now().timestamp() + ttl_secs as i64),
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

/// Fixed-window rate counter state.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u64,
    reset_at: i64,
}

/// The embedded backend. All maps are concurrent; the master lock is a
/// plain mutex since acquisition must observe-and-set in one step.
#[derive(Clone)]
pub struct MemoryStorage {
    ttls: TtlSettings,
    nodes: Arc<DashMap<String, Node>>,
    sessions: Arc<DashMap<String, Expiring<ClientSession>>>,
    shares: Arc<DashMap<String, Expiring<ShareSession>>>,
    uploads: Arc<DashMap<String, Expiring<UploadState>>>,
    active_uploads: Arc<DashMap<String, ()>>,
    cancelled: Arc<DashMap<String, Expiring<BTreeSet<String>>>>,
    rate_windows: Arc<DashMap<String, RateWindow>>,
    counters: Arc<DashMap<String, u64>>,
    master_lock: Arc<Mutex<Option<(String, i64)>>>,
}

impl MemoryStorage {
    pub fn new(ttls: TtlSettings) -> Self {
        Self {
            ttls,
            nodes: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
            shares: Arc::new(DashMap::new()),
            uploads: Arc::new(DashMap::new()),
            active_uploads: Arc::new(DashMap::new()),
            cancelled: Arc::new(DashMap::new()),
            rate_windows: Arc::new(DashMap::new()),
            counters: Arc::new(DashMap::new()),
            master_lock: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(TtlSettings::default())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put_node(&self, node: &Node) -> Result<(), StorageError> {
        self.nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<Node>, StorageError> {
        Ok(self.nodes.get(node_id).map(|n| n.clone()))
    }

    async fn find_node_by_addr(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<Option<Node>, StorageError> {
        Ok(self
            .nodes
            .iter()
            .find(|n| n.hostname == hostname && n.port == port)
            .map(|n| n.clone()))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StorageError> {
        Ok(self.nodes.iter().map(|n| n.clone()).collect())
    }

    async fn put_session(&self, session: &ClientSession) -> Result<(), StorageError> {
        let key = session_key(&session.client_id, &session.socket_id);
        self.sessions.insert(
            key,
            Expiring::with_ttl(session.clone(), self.ttls.client_session_secs),
        );
        Ok(())
    }

    async fn get_session(
        &self,
        client_id: &str,
        socket_id: &str,
    ) -> Result<Option<ClientSession>, StorageError> {
        let key = session_key(client_id, socket_id);
        let now = Utc::now().timestamp();
        if let Some(entry) = self.sessions.get(&key) {
            if entry.is_expired(now) {
                drop(entry);
                self.sessions.remove(&key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn sessions_for_client(
        &self,
        client_id: &str,
    ) -> Result<Vec<ClientSession>, StorageError> {
        let now = Utc::now().timestamp();
        Ok(self
            .sessions
            .iter()
            .filter(|entry| !entry.is_expired(now) && entry.value.client_id == client_id)
            .map(|entry| entry.value.clone())
            .collect())
    }

    async fn count_connected_sessions(&self) -> Result<u64, StorageError> {
        let now = Utc::now().timestamp();
        Ok(self
            .sessions
            .iter()
            .filter(|entry| !entry.is_expired(now) && entry.value.connected)
            .count() as u64)
    }

    async fn deactivate_sessions_on_node(&self, node_id: &str) -> Result<u64, StorageError> {
        let mut touched = 0u64;
        for mut entry in self.sessions.iter_mut() {
            if entry.value.node_id == node_id && entry.value.connected {
                entry.value.connected = false;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn create_share(&self, share: &ShareSession) -> Result<bool, StorageError> {
        let now = Utc::now().timestamp();
        match self.shares.entry(share.share_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Expiring::with_ttl(
                        share.clone(),
                        self.ttls.share_session_secs,
                    ));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Expiring::with_ttl(
                    share.clone(),
                    self.ttls.share_session_secs,
                ));
                Ok(true)
            }
        }
    }

    async fn get_share(&self, share_id: &str) -> Result<Option<ShareSession>, StorageError> {
        let now = Utc::now().timestamp();
        if let Some(entry) = self.shares.get(share_id) {
            if entry.is_expired(now) {
                drop(entry);
                self.shares.remove(share_id);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn put_share(&self, share: &ShareSession) -> Result<(), StorageError> {
        self.shares.insert(
            share.share_id.clone(),
            Expiring::with_ttl(share.clone(), self.ttls.share_session_secs),
        );
        Ok(())
    }

    async fn remove_share(&self, share_id: &str) -> Result<(), StorageError> {
        self.shares.remove(share_id);
        Ok(())
    }

    async fn put_upload(&self, state: &UploadState) -> Result<(), StorageError> {
        if state.status.is_terminal() {
            self.active_uploads.remove(&state.file_id);
        } else {
            self.active_uploads.insert(state.file_id.clone(), ());
        }
        self.uploads.insert(
            state.file_id.clone(),
            Expiring::with_ttl(state.clone(), self.ttls.upload_state_secs),
        );
        Ok(())
    }

    async fn get_upload(&self, file_id: &str) -> Result<Option<UploadState>, StorageError> {
        let now = Utc::now().timestamp();
        if let Some(entry) = self.uploads.get(file_id) {
            if entry.is_expired(now) {
                drop(entry);
                self.uploads.remove(file_id);
                self.active_uploads.remove(file_id);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn remove_upload(&self, file_id: &str) -> Result<(), StorageError> {
        self.uploads.remove(file_id);
        self.active_uploads.remove(file_id);
        Ok(())
    }

    async fn active_upload_ids(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .active_uploads
            .iter()
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn all_upload_ids(&self) -> Result<Vec<String>, StorageError> {
        let now = Utc::now().timestamp();
        Ok(self
            .uploads
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn add_cancelled_download(
        &self,
        file_id: &str,
        client_id: &str,
    ) -> Result<(), StorageError> {
        let ttl = self.ttls.upload_state_secs;
        let now = Utc::now().timestamp();
        let mut entry = self
            .cancelled
            .entry(file_id.to_string())
            .or_insert_with(|| Expiring::with_ttl(BTreeSet::new(), ttl));
        if entry.is_expired(now) {
            *entry = Expiring::with_ttl(BTreeSet::new(), ttl);
        }
        entry.value.insert(client_id.to_string());
        Ok(())
    }

    async fn is_download_cancelled(
        &self,
        file_id: &str,
        client_id: &str,
    ) -> Result<bool, StorageError> {
        let now = Utc::now().timestamp();
        Ok(self
            .cancelled
            .get(file_id)
            .map(|entry| !entry.is_expired(now) && entry.value.contains(client_id))
            .unwrap_or(false))
    }

    async fn clear_cancelled(&self, file_id: &str) -> Result<(), StorageError> {
        self.cancelled.remove(file_id);
        Ok(())
    }

    async fn check_rate_limit(
        &self,
        key: &str,
        max: u64,
        window_secs: u64,
    ) -> Result<RateLimitDecision, StorageError> {
        let now = Utc::now().timestamp();
        let mut window = self
            .rate_windows
            .entry(key.to_string())
            .or_insert(RateWindow {
                count: 0,
                reset_at: now + window_secs as i64,
            });
        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + window_secs as i64;
        }
        window.count += 1;
        Ok(RateLimitDecision {
            allowed: window.count <= max,
            remaining: max.saturating_sub(window.count),
            reset_at: window.reset_at,
        })
    }

    async fn try_acquire_master_lock(
        &self,
        node_id: &str,
        ttl_secs: u64,
    ) -> Result<bool, StorageError> {
        let now = Utc::now().timestamp();
        let mut lock = self.master_lock.lock().unwrap_or_else(|e| e.into_inner());
        match lock.as_ref() {
            Some((_, expires_at)) if now < *expires_at => Ok(false),
            _ => {
                *lock = Some((node_id.to_string(), now + ttl_secs as i64));
                Ok(true)
            }
        }
    }

    async fn refresh_master_lock(
        &self,
        node_id: &str,
        ttl_secs: u64,
    ) -> Result<bool, StorageError> {
        let now = Utc::now().timestamp();
        let mut lock = self.master_lock.lock().unwrap_or_else(|e| e.into_inner());
        match lock.as_ref() {
            Some((holder, expires_at)) if holder == node_id && now < *expires_at => {
                *lock = Some((node_id.to_string(), now + ttl_secs as i64));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_master(&self) -> Result<Option<String>, StorageError> {
        let now = Utc::now().timestamp();
        let lock = self.master_lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(match lock.as_ref() {
            Some((holder, expires_at)) if now < *expires_at => Some(holder.clone()),
            _ => None,
        })
    }

    async fn incr_counter(&self, name: &str) -> Result<u64, StorageError> {
        let mut entry = self.counters.entry(name.to_string()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn get_counter(&self, name: &str) -> Result<u64, StorageError> {
        Ok(self.counters.get(name).map(|c| *c).unwrap_or(0))
    }

    async fn sweep_expired(&self) -> Result<(), StorageError> {
        let now = Utc::now().timestamp();

        let before = self.sessions.len() + self.shares.len() + self.uploads.len();
        self.sessions.retain(|_, entry| !entry.is_expired(now));
        self.shares.retain(|_, entry| !entry.is_expired(now));
        self.uploads.retain(|_, entry| !entry.is_expired(now));
        self.cancelled.retain(|_, entry| !entry.is_expired(now));
        self.rate_windows.retain(|_, window| now < window.reset_at);

        // Keep the active index consistent with reaped uploads.
        self.active_uploads
            .retain(|file_id, _| self.uploads.contains_key(file_id));

        let after = self.sessions.len() + self.shares.len() + self.uploads.len();
        if after < before {
            tracing::debug!(removed = before - after, "Swept expired storage entries");
        }
        Ok(())
    }
}
