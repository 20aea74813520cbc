//! HTTP surface.
//!
//! Admission endpoints for share sessions plus cluster observability.
//! Business decisions stay in the session manager and the coordinator;
//! these handlers only translate HTTP to engine calls. Errors serialize as
//! `{"error": {"code", "message", "details?"}}`.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequest, Path, Request, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::error::RelayError;
use crate::model::NodeRole;
use crate::state::RelayNode;

/// JSON body extractor whose rejections speak the error envelope.
///
/// Axum's own `Json` rejection renders plain text; every error on this
/// surface must serialize as `{"error": {...}}`, so extraction failures
/// are mapped into [`RelayError`] before they reach the client.
#[derive(Debug)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = RelayError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => Err(RelayError::BadRequest(rejection.body_text())),
        }
    }
}

/// GET /api/health
pub async fn health(State(node): State<Arc<RelayNode>>) -> impl IntoResponse {
    let mut body = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "features": {
            "redis": node.config.use_redis,
            "cluster": node.config.use_cluster,
            "checksums": node.config.checksums_enabled,
        },
    });

    if node.config.use_cluster {
        let role = if node.coordinator.is_master() {
            NodeRole::Master
        } else {
            NodeRole::Worker
        };
        body["cluster"] = json!({
            "role": role.as_str(),
            "nodeId": node.node_id(),
        });
    }

    Json(body)
}

/// GET /api/stats
pub async fn stats(State(node): State<Arc<RelayNode>>) -> impl IntoResponse {
    let files_sent = node.storage.get_counter("files_sent").await.unwrap_or(0);
    let users_joined = node.storage.get_counter("users_joined").await.unwrap_or(0);
    let active_sessions = node
        .storage
        .count_connected_sessions()
        .await
        .unwrap_or_else(|_| node.registry.online_count() as u64);

    Json(json!({
        "filesSent": files_sent,
        "activeSessions": active_sessions,
        "usersJoined": users_joined,
    }))
}

/// GET /api/cluster/nodes
pub async fn cluster_nodes(
    State(node): State<Arc<RelayNode>>,
) -> Result<impl IntoResponse, RelayError> {
    let nodes = node.storage.list_nodes().await?;
    let listing: Vec<_> = nodes
        .iter()
        .map(|n| {
            json!({
                "id": n.id,
                "hostname": n.hostname,
                "port": n.port,
                "status": n.status,
            })
        })
        .collect();

    Ok(Json(json!({ "success": true, "nodes": listing })))
}

/// GET /api/cluster/master
pub async fn cluster_master(State(node): State<Arc<RelayNode>>) -> impl IntoResponse {
    let master_id = node.coordinator.master_id().await;
    let is_me = master_id.as_deref() == Some(node.node_id());

    Json(json!({
        "success": true,
        "masterId": master_id,
        "isMe": is_me,
        "nodeId": node.node_id(),
    }))
}

/// GET /api/cluster/stats
pub async fn cluster_stats(
    State(node): State<Arc<RelayNode>>,
) -> Result<impl IntoResponse, RelayError> {
    let nodes = node.storage.list_nodes().await?;
    let sessions = node.storage.count_connected_sessions().await?;
    let role = if node.coordinator.is_master() {
        NodeRole::Master
    } else {
        NodeRole::Worker
    };

    Ok(Json(json!({
        "success": true,
        "stats": {
            "role": role.as_str(),
            "nodeId": node.node_id(),
            "nodes": nodes.len(),
            "sessions": sessions,
        },
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShareRequest {
    pub client_id: String,
    #[serde(default)]
    pub share_id: Option<String>,
}

/// POST /api/share/create
pub async fn create_share(
    State(node): State<Arc<RelayNode>>,
    ValidatedJson(request): ValidatedJson<CreateShareRequest>,
) -> Result<impl IntoResponse, RelayError> {
    if request.client_id.is_empty() {
        return Err(RelayError::BadRequest("clientId is required".to_string()));
    }

    let share = node
        .sessions
        .create_share(&request.client_id, request.share_id)
        .await?;

    Ok(Json(json!({ "success": true, "shareId": share.share_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinShareRequest {
    pub share_id: String,
    pub client_id: String,
}

/// POST /api/share/join
pub async fn join_share(
    State(node): State<Arc<RelayNode>>,
    ValidatedJson(request): ValidatedJson<JoinShareRequest>,
) -> Result<impl IntoResponse, RelayError> {
    if request.client_id.is_empty() || request.share_id.is_empty() {
        return Err(RelayError::BadRequest(
            "shareId and clientId are required".to_string(),
        ));
    }

    let share = node
        .sessions
        .join_share(&request.share_id, &request.client_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "shareId": share.share_id,
        "connectedClients": share.clients.len(),
    })))
}

/// GET /api/uploads/:file_id — progress snapshot.
pub async fn upload_progress(
    State(node): State<Arc<RelayNode>>,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let state = node.transfers.upload_snapshot(&file_id).await?;

    Ok(Json(json!({
        "fileId": state.file_id,
        "fileName": state.file_name,
        "fileSize": state.file_size,
        "status": state.status,
        "uploadedChunks": state.uploaded_chunks.len(),
        "totalChunks": state.total_chunks,
        "progress": state.progress_percent(),
        "startTime": state.start_time,
        "lastUpdate": state.last_update,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use axum::body::Body;

    fn json_request(body: &str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_validated_json_parses_valid_body() {
        let request = json_request("{\"clientId\":\"alice\",\"shareId\":\"share-1\"}");
        let ValidatedJson(parsed) =
            ValidatedJson::<CreateShareRequest>::from_request(request, &())
                .await
                .unwrap();
        assert_eq!(parsed.client_id, "alice");
        assert_eq!(parsed.share_id.as_deref(), Some("share-1"));
    }

    #[tokio::test]
    async fn test_validated_json_maps_malformed_body_to_bad_request() {
        let request = json_request("{not json");
        let err = ValidatedJson::<CreateShareRequest>::from_request(request, &())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_validated_json_maps_missing_field_to_bad_request() {
        // Valid JSON, but not a valid request shape.
        let request = json_request("{\"shareId\":\"share-1\"}");
        let err = ValidatedJson::<JoinShareRequest>::from_request(request, &())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }
}
