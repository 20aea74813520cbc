//! Relay configuration.
//!
//! All knobs come from the environment (parsed by the `Args` struct in
//! `main.rs`) and collapse into this plain struct so tests can build one
//! by hand.

/// Default node heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;

/// A node is considered dead after 3 missed heartbeats.
pub const DEAD_NODE_AFTER_SECS: i64 = 30;

/// Leader lock TTL in seconds.
pub const MASTER_LOCK_TTL_SECS: u64 = 15;

/// Leader election cadence in seconds.
pub const ELECTION_INTERVAL_SECS: u64 = 5;

/// ACK scan cadence in milliseconds.
pub const ACK_SCAN_INTERVAL_MS: u64 = 2_000;

/// Completed uploads are reaped this long after their last update.
pub const COMPLETED_UPLOAD_REAP_SECS: i64 = 5 * 60;

/// Stalled `uploading` uploads are reaped after this much silence.
pub const SILENT_UPLOAD_REAP_SECS: i64 = 24 * 3600;

/// Default client session grace TTL (1 hour).
pub const DEFAULT_TTL_CLIENT_SESSION_SECS: u64 = 3600;

/// Default share session TTL.
pub const DEFAULT_TTL_SHARE_SESSION_SECS: u64 = 24 * 3600;

/// Default upload state TTL.
pub const DEFAULT_TTL_UPLOAD_STATE_SECS: u64 = 24 * 3600;

/// Default rate-limit window.
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Default heartbeat rate limit per client per window.
pub const DEFAULT_HEARTBEAT_LIMIT: u64 = 1000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub cors_origin: Option<String>,
    pub hostname: String,

    /// Run as part of a multi-node cluster (requires the redis backend).
    pub use_cluster: bool,
    /// Use redis for storage and pub/sub instead of the embedded backend.
    pub use_redis: bool,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_db: i64,

    pub max_file_size: u64,
    pub chunk_size: u64,
    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
    pub max_concurrent_transfers: usize,

    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    /// Compute and verify per-chunk SHA-256 checksums.
    pub checksums_enabled: bool,

    pub master_lock_ttl_secs: u64,
    pub election_interval_secs: u64,

    pub heartbeat_secs: u64,
    pub heartbeat_limit: u64,

    pub ttl_client_session_secs: u64,
    pub ttl_share_session_secs: u64,
    pub ttl_upload_state_secs: u64,
    pub rate_limit_window_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            cors_origin: None,
            hostname: "localhost".to_string(),
            use_cluster: false,
            use_redis: false,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_password: None,
            redis_db: 0,
            max_file_size: 1024 * 1024 * 1024,
            chunk_size: 64 * 1024,
            max_concurrent_uploads: 10,
            max_concurrent_downloads: 10,
            max_concurrent_transfers: 5,
            ack_timeout_ms: 10_000,
            max_retries: 3,
            checksums_enabled: true,
            master_lock_ttl_secs: MASTER_LOCK_TTL_SECS,
            election_interval_secs: ELECTION_INTERVAL_SECS,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            heartbeat_limit: DEFAULT_HEARTBEAT_LIMIT,
            ttl_client_session_secs: DEFAULT_TTL_CLIENT_SESSION_SECS,
            ttl_share_session_secs: DEFAULT_TTL_SHARE_SESSION_SECS,
            ttl_upload_state_secs: DEFAULT_TTL_UPLOAD_STATE_SECS,
            rate_limit_window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
        }
    }
}

impl RelayConfig {
    /// Redis connection URL derived from the individual settings.
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.max_file_size, 1024 * 1024 * 1024);
        assert_eq!(config.max_concurrent_uploads, 10);
        assert_eq!(config.max_concurrent_transfers, 5);
        assert_eq!(config.ack_timeout_ms, 10_000);
        assert_eq!(config.max_retries, 3);
        assert!(!config.use_cluster);
    }

    #[test]
    fn test_redis_url_without_password() {
        let config = RelayConfig::default();
        assert_eq!(config.redis_url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn test_redis_url_with_password() {
        let config = RelayConfig {
            redis_password: Some("hunter2".to_string()),
            redis_db: 3,
            ..RelayConfig::default()
        };
        assert_eq!(config.redis_url(), "redis://:hunter2@127.0.0.1:6379/3");
    }
}
