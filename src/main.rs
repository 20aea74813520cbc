//! Beamdrop Relay Server
//!
//! A clustered relay for browser-to-browser file sharing:
//!
//! 1. **Share sessions**: two clients rendezvous in a named share room
//!    over HTTP, then stream over a persistent event channel.
//!
//! 2. **Chunked transfer relay**: the sender's chunks fan out to the
//!    other participant with acknowledgment, retry, and timeout
//!    escalation; the per-chunk reply is the sender's flow control.
//!
//! 3. **Cluster mode**: multiple instances coordinate through a shared
//!    redis store — leader election on an expiring lock, cross-node
//!    routing over pub/sub — so the two peers of a session may sit on
//!    different nodes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use beamdrop_relay::config::RelayConfig;
use beamdrop_relay::gateway;
use beamdrop_relay::http;
use beamdrop_relay::pubsub::memory::MemoryPubSub;
use beamdrop_relay::pubsub::redis_pubsub::RedisPubSub;
use beamdrop_relay::pubsub::PubSub;
use beamdrop_relay::state::RelayNode;
use beamdrop_relay::storage::memory::MemoryStorage;
use beamdrop_relay::storage::redis_store::RedisStorage;
use beamdrop_relay::storage::{Storage, TtlSettings};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "beamdrop-relay", version, about = "Beamdrop file-sharing relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3001, env = "PORT")]
    port: u16,

    /// Allowed CORS origin (all origins when unset)
    #[arg(long, env = "CORS_ORIGIN")]
    cors_origin: Option<String>,

    /// Hostname this node registers under in the cluster
    #[arg(long, default_value = "localhost", env = "NODE_HOSTNAME")]
    hostname: String,

    /// Join a multi-node cluster (requires the redis backend)
    #[arg(long, default_value_t = false, env = "USE_CLUSTER")]
    use_cluster: bool,

    /// Use redis for storage and pub/sub instead of the embedded backend
    #[arg(long, default_value_t = false, env = "USE_REDIS")]
    use_redis: bool,

    #[arg(long, default_value = "127.0.0.1", env = "REDIS_HOST")]
    redis_host: String,

    #[arg(long, default_value_t = 6379, env = "REDIS_PORT")]
    redis_port: u16,

    #[arg(long, env = "REDIS_PASSWORD")]
    redis_password: Option<String>,

    #[arg(long, default_value_t = 0, env = "REDIS_DB")]
    redis_db: i64,

    /// Maximum accepted file size in bytes
    #[arg(long, default_value_t = 1024 * 1024 * 1024, env = "MAX_FILE_SIZE")]
    max_file_size: u64,

    /// Chunk size clients are expected to use, in bytes
    #[arg(long, default_value_t = 64 * 1024, env = "CHUNK_SIZE")]
    chunk_size: u64,

    #[arg(long, default_value_t = 10, env = "MAX_CONCURRENT_UPLOADS")]
    max_concurrent_uploads: usize,

    #[arg(long, default_value_t = 10, env = "MAX_CONCURRENT_DOWNLOADS")]
    max_concurrent_downloads: usize,

    #[arg(long, default_value_t = 5, env = "MAX_CONCURRENT_TRANSFERS")]
    max_concurrent_transfers: usize,

    /// How long a relayed chunk may stay unacknowledged, in milliseconds
    #[arg(long, default_value_t = 10_000, env = "ACK_TIMEOUT_MS")]
    ack_timeout_ms: u64,

    /// Retry budget per chunk before the transfer fails
    #[arg(long, default_value_t = 3, env = "MAX_RETRIES")]
    max_retries: u32,

    /// Client session grace TTL in seconds
    #[arg(long, default_value_t = 3600, env = "TTL_CLIENT_SESSION")]
    ttl_client_session: u64,

    /// Share session TTL in seconds
    #[arg(long, default_value_t = 24 * 3600, env = "TTL_SHARE_SESSION")]
    ttl_share_session: u64,

    /// Upload state TTL in seconds
    #[arg(long, default_value_t = 24 * 3600, env = "TTL_UPLOAD_STATE")]
    ttl_upload_state: u64,

    /// Rate-limit window in seconds
    #[arg(long, default_value_t = 60, env = "TTL_RATE_LIMIT_WINDOW")]
    rate_limit_window: u64,

    /// Node heartbeat interval in seconds
    #[arg(long, default_value_t = 10, env = "TTL_HEARTBEAT")]
    heartbeat_secs: u64,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            port: self.port,
            cors_origin: self.cors_origin,
            hostname: self.hostname,
            use_cluster: self.use_cluster,
            use_redis: self.use_redis || self.use_cluster,
            redis_host: self.redis_host,
            redis_port: self.redis_port,
            redis_password: self.redis_password,
            redis_db: self.redis_db,
            max_file_size: self.max_file_size,
            chunk_size: self.chunk_size,
            max_concurrent_uploads: self.max_concurrent_uploads,
            max_concurrent_downloads: self.max_concurrent_downloads,
            max_concurrent_transfers: self.max_concurrent_transfers,
            ack_timeout_ms: self.ack_timeout_ms,
            max_retries: self.max_retries,
            ttl_client_session_secs: self.ttl_client_session,
            ttl_share_session_secs: self.ttl_share_session,
            ttl_upload_state_secs: self.ttl_upload_state,
            rate_limit_window_secs: self.rate_limit_window,
            heartbeat_secs: self.heartbeat_secs,
            ..RelayConfig::default()
        }
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beamdrop_relay=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    if args.use_cluster && !args.use_redis {
        tracing::warn!("Cluster mode requires the redis backend, enabling it");
    }
    let config = args.into_config();

    // ── Backend selection ─────────────────────────────────────────────────

    let ttls = TtlSettings::from_config(&config);
    let (storage, pubsub): (Arc<dyn Storage>, Arc<dyn PubSub>) = if config.use_redis {
        let url = config.redis_url();
        tracing::info!(
            host = config.redis_host.as_str(),
            port = config.redis_port,
            db = config.redis_db,
            "Using redis backend"
        );

        let storage = match RedisStorage::connect(&url, ttls).await {
            Ok(storage) => storage,
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to redis");
                std::process::exit(1);
            }
        };
        let pubsub = match RedisPubSub::connect(&url).await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                tracing::error!(error = %e, "Failed to open redis pub/sub");
                std::process::exit(1);
            }
        };
        (Arc::new(storage), Arc::new(pubsub))
    } else {
        tracing::info!("Using embedded backend (standalone mode)");
        (
            Arc::new(MemoryStorage::new(ttls)),
            Arc::new(MemoryPubSub::new()),
        )
    };

    // ── Node wiring ───────────────────────────────────────────────────────

    let node = match RelayNode::new(config.clone(), storage, pubsub).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %e, "Failed to register node");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = node.start(shutdown_rx.clone()).await {
        tracing::error!(error = %e, "Failed to attach fabric subscriptions");
        std::process::exit(1);
    }
    let timer_handles = node.spawn_timers(shutdown_rx);

    // ── Router ────────────────────────────────────────────────────────────

    let cors = match &node.config.cors_origin {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(origin) => CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
            Err(e) => {
                tracing::warn!(error = %e, "Invalid CORS origin, allowing any");
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods([Method::GET, Method::POST])
                    .allow_headers(Any)
            }
        },
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/health", get(http::health))
        .route("/api/stats", get(http::stats))
        .route("/api/cluster/nodes", get(http::cluster_nodes))
        .route("/api/cluster/master", get(http::cluster_master))
        .route("/api/cluster/stats", get(http::cluster_stats))
        .route("/api/share/create", post(http::create_share))
        .route("/api/share/join", post(http::join_share))
        .route("/api/uploads/:file_id", get(http::upload_progress))
        .with_state(node.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", node.config.port);
    tracing::info!(
        node_id = node.node_id(),
        cluster = node.config.use_cluster,
        "Beamdrop relay listening on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    // In-flight connections drain while the signal propagates.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // ── Graceful teardown ─────────────────────────────────────────────────

    let _ = shutdown_tx.send(true);
    node.shutdown().await;
    for handle in timer_handles {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    tracing::info!("Shutdown complete");
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client event channels.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(node): State<Arc<RelayNode>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| gateway::handle_socket(socket, node))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining connections");
}
