//! Redis storage backend.
//!
//! The distributed backend required for cluster mode. Entities are JSON
//! blobs under namespaced keys; expiry is native key TTL; the leader lock
//! is `SET NX EX`; cancellation marks are sets; rate windows are
//! `INCR` + `EXPIRE`.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    cancelled_key, counter_key, node_key, rate_key, session_key, share_key, upload_key, Storage,
    TtlSettings, MASTER_LOCK_KEY,
};
use crate::error::StorageError;
use crate::model::{ClientSession, Node, RateLimitDecision, ShareSession, UploadState};

const NODES_INDEX: &str = "cluster:nodes";
const ACTIVE_UPLOADS_INDEX: &str = "uploads:active";

/// Compare-and-extend for the leader lease. A plain GET + EXPIRE pair is
/// not atomic: the key can expire and be re-claimed by another node
/// between the two calls, and EXPIRE would still extend the new holder's
/// key. The script checks the holder and extends in one step.
const REFRESH_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

fn client_sessions_key(client_id: &str) -> String {
    format!("client-sessions:{}", client_id)
}

/// Redis-backed [`Storage`]. The connection manager reconnects on its
/// own and is shared by cloning the handle.
#[derive(Clone)]
pub struct RedisStorage {
    conn: ConnectionManager,
    ttls: TtlSettings,
}

impl RedisStorage {
    /// Connect to redis at `url` (see `RelayConfig::redis_url`).
    pub async fn connect(url: &str, ttls: TtlSettings) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, ttls })
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    // Unreadable records are treated as missing keys.
                    tracing::warn!(key = key, error = %e, "Dropping unparseable record");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: Option<u64>,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(json);
        if let Some(ttl) = ttl_secs {
            cmd.arg("EX").arg(ttl);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await?;
        Ok(keys)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn put_node(&self, node: &Node) -> Result<(), StorageError> {
        self.set_json(&node_key(&node.id), node, None).await?;
        let mut conn = self.conn.clone();
        redis::cmd("SADD")
            .arg(NODES_INDEX)
            .arg(&node.id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<Node>, StorageError> {
        self.get_json(&node_key(node_id)).await
    }

    async fn find_node_by_addr(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<Option<Node>, StorageError> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .find(|n| n.hostname == hostname && n.port == port))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StorageError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(NODES_INDEX)
            .query_async(&mut conn)
            .await?;
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.get_json::<Node>(&node_key(&id)).await? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    async fn put_session(&self, session: &ClientSession) -> Result<(), StorageError> {
        let ttl = self.ttls.client_session_secs;
        self.set_json(
            &session_key(&session.client_id, &session.socket_id),
            session,
            Some(ttl),
        )
        .await?;

        let index = client_sessions_key(&session.client_id);
        let mut conn = self.conn.clone();
        redis::cmd("SADD")
            .arg(&index)
            .arg(&session.socket_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        redis::cmd("EXPIRE")
            .arg(&index)
            .arg(ttl)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_session(
        &self,
        client_id: &str,
        socket_id: &str,
    ) -> Result<Option<ClientSession>, StorageError> {
        self.get_json(&session_key(client_id, socket_id)).await
    }

    async fn sessions_for_client(
        &self,
        client_id: &str,
    ) -> Result<Vec<ClientSession>, StorageError> {
        let index = client_sessions_key(client_id);
        let mut conn = self.conn.clone();
        let socket_ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&index)
            .query_async(&mut conn)
            .await?;

        let mut sessions = Vec::new();
        for socket_id in socket_ids {
            match self.get_session(client_id, &socket_id).await? {
                Some(session) => sessions.push(session),
                None => {
                    // Session key expired; drop the stale index member.
                    redis::cmd("SREM")
                        .arg(&index)
                        .arg(&socket_id)
                        .query_async::<_, ()>(&mut conn)
                        .await?;
                }
            }
        }
        Ok(sessions)
    }

    async fn count_connected_sessions(&self) -> Result<u64, StorageError> {
        let mut count = 0u64;
        for key in self.keys("session:*").await? {
            if let Some(session) = self.get_json::<ClientSession>(&key).await? {
                if session.connected {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn deactivate_sessions_on_node(&self, node_id: &str) -> Result<u64, StorageError> {
        let mut touched = 0u64;
        for key in self.keys("session:*").await? {
            if let Some(mut session) = self.get_json::<ClientSession>(&key).await? {
                if session.node_id == node_id && session.connected {
                    session.connected = false;
                    let json = serde_json::to_string(&session)?;
                    let mut conn = self.conn.clone();
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(json)
                        .arg("KEEPTTL")
                        .query_async::<_, ()>(&mut conn)
                        .await?;
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    async fn create_share(&self, share: &ShareSession) -> Result<bool, StorageError> {
        let json = serde_json::to_string(share)?;
        let mut conn = self.conn.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(share_key(&share.share_id))
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(self.ttls.share_session_secs)
            .query_async(&mut conn)
            .await?;
        Ok(created.is_some())
    }

    async fn get_share(&self, share_id: &str) -> Result<Option<ShareSession>, StorageError> {
        self.get_json(&share_key(share_id)).await
    }

    async fn put_share(&self, share: &ShareSession) -> Result<(), StorageError> {
        self.set_json(
            &share_key(&share.share_id),
            share,
            Some(self.ttls.share_session_secs),
        )
        .await
    }

    async fn remove_share(&self, share_id: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(share_key(share_id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn put_upload(&self, state: &UploadState) -> Result<(), StorageError> {
        self.set_json(
            &upload_key(&state.file_id),
            state,
            Some(self.ttls.upload_state_secs),
        )
        .await?;

        let mut conn = self.conn.clone();
        if state.status.is_terminal() {
            redis::cmd("SREM")
                .arg(ACTIVE_UPLOADS_INDEX)
                .arg(&state.file_id)
                .query_async::<_, ()>(&mut conn)
                .await?;
        } else {
            redis::cmd("SADD")
                .arg(ACTIVE_UPLOADS_INDEX)
                .arg(&state.file_id)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn get_upload(&self, file_id: &str) -> Result<Option<UploadState>, StorageError> {
        self.get_json(&upload_key(file_id)).await
    }

    async fn remove_upload(&self, file_id: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(upload_key(file_id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        redis::cmd("SREM")
            .arg(ACTIVE_UPLOADS_INDEX)
            .arg(file_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn active_upload_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(ACTIVE_UPLOADS_INDEX)
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn all_upload_ids(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .keys("upload:*")
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix("upload:").map(str::to_string))
            .collect())
    }

    async fn add_cancelled_download(
        &self,
        file_id: &str,
        client_id: &str,
    ) -> Result<(), StorageError> {
        let key = cancelled_key(file_id);
        let mut conn = self.conn.clone();
        redis::cmd("SADD")
            .arg(&key)
            .arg(client_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttls.upload_state_secs)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_download_cancelled(
        &self,
        file_id: &str,
        client_id: &str,
    ) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();
        let member: bool = redis::cmd("SISMEMBER")
            .arg(cancelled_key(file_id))
            .arg(client_id)
            .query_async(&mut conn)
            .await?;
        Ok(member)
    }

    async fn clear_cancelled(&self, file_id: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(cancelled_key(file_id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn check_rate_limit(
        &self,
        key: &str,
        max: u64,
        window_secs: u64,
    ) -> Result<RateLimitDecision, StorageError> {
        let key = rate_key(key);
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("INCR").arg(&key).query_async(&mut conn).await?;
        if count == 1 {
            redis::cmd("EXPIRE")
                .arg(&key)
                .arg(window_secs)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await?;
        Ok(RateLimitDecision {
            allowed: count <= max,
            remaining: max.saturating_sub(count),
            reset_at: Utc::now().timestamp() + ttl.max(0),
        })
    }

    async fn try_acquire_master_lock(
        &self,
        node_id: &str,
        ttl_secs: u64,
    ) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(MASTER_LOCK_KEY)
            .arg(node_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn refresh_master_lock(
        &self,
        node_id: &str,
        ttl_secs: u64,
    ) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = redis::Script::new(REFRESH_LOCK_SCRIPT)
            .key(MASTER_LOCK_KEY)
            .arg(node_id)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    async fn current_master(&self) -> Result<Option<String>, StorageError> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = redis::cmd("GET")
            .arg(MASTER_LOCK_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(holder)
    }

    async fn incr_counter(&self, name: &str) -> Result<u64, StorageError> {
        let mut conn = self.conn.clone();
        let value: u64 = redis::cmd("INCR")
            .arg(counter_key(name))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get_counter(&self, name: &str) -> Result<u64, StorageError> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = redis::cmd("GET")
            .arg(counter_key(name))
            .query_async(&mut conn)
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn sweep_expired(&self) -> Result<(), StorageError> {
        // Key TTLs do the sweeping server-side.
        Ok(())
    }
}
