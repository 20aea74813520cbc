//! Chunked upload relay.
//!
//! One upload moves fixed-size chunks from the sender to the other share
//! participant. Every chunk gets a pending-ack entry; fan-out success
//! synthesizes the acknowledgment back to the sender, a stalled entry is
//! retried by the periodic scan, and an exhausted retry budget fails the
//! whole transfer. Upload state is mutated under a per-file mutex — the
//! chunk handler, the ACK scanner, and the completion path all contend
//! for the same record.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{RelayConfig, COMPLETED_UPLOAD_REAP_SECS, SILENT_UPLOAD_REAP_SECS};
use crate::coordinator::Coordinator;
use crate::error::RelayError;
use crate::model::{ClientSession, PendingAck, UploadState, UploadStatus};
use crate::protocol::{Blob, ServerEvent};
use crate::session::latest_session;
use crate::storage::Storage;

pub struct TransferEngine {
    config: RelayConfig,
    storage: Arc<dyn Storage>,
    coordinator: Arc<Coordinator>,
    file_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl TransferEngine {
    pub fn new(
        config: RelayConfig,
        storage: Arc<dyn Storage>,
        coordinator: Arc<Coordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            coordinator,
            file_locks: Arc::new(DashMap::new()),
        })
    }

    fn file_lock(&self, file_id: &str) -> Arc<Mutex<()>> {
        self.file_locks
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ── Upload init ───────────────────────────────────────────────────────

    /// Admit a new upload. Returns the allocated file id and the resume
    /// offset (0 for a fresh upload).
    pub async fn init_upload(
        &self,
        client_id: &str,
        file_name: &str,
        file_size: u64,
        total_chunks: u32,
    ) -> Result<(String, u32), RelayError> {
        if file_size > self.config.max_file_size {
            return Err(RelayError::FileTooLarge {
                size: file_size,
                max: self.config.max_file_size,
            });
        }
        if total_chunks == 0 {
            return Err(RelayError::BadRequest("totalChunks must be positive".to_string()));
        }

        let mut sender = latest_session(self.storage.as_ref(), client_id)
            .await
            .ok_or_else(|| RelayError::BadRequest(format!("unknown client '{}'", client_id)))?;

        if sender.uploads.len() >= self.config.max_concurrent_uploads {
            return Err(RelayError::UploadFailed(
                "Too many concurrent uploads".to_string(),
            ));
        }
        if sender.transfer_count() >= self.config.max_concurrent_transfers {
            return Err(RelayError::UploadFailed(
                "Too many concurrent transfers".to_string(),
            ));
        }

        // Recipients come from the sender's share: the other participant,
        // if any. A single-client share still admits the upload.
        let peers = match &sender.share_id {
            Some(share_id) => match self.storage.get_share(share_id).await? {
                Some(share) => share.peers_of(client_id),
                None => Vec::new(),
            },
            None => Vec::new(),
        };

        let mut receivers: Vec<ClientSession> = Vec::new();
        for peer in &peers {
            let Some(peer_session) = latest_session(self.storage.as_ref(), peer).await else {
                continue;
            };
            if peer_session.downloads.len() >= self.config.max_concurrent_downloads
                || peer_session.transfer_count() >= self.config.max_concurrent_transfers
            {
                tracing::debug!(
                    receiver = peer.as_str(),
                    "Skipping receiver over transfer budget"
                );
                continue;
            }
            receivers.push(peer_session);
        }

        if !peers.is_empty() && receivers.is_empty() {
            return Err(RelayError::UploadFailed(
                "All receivers are busy".to_string(),
            ));
        }

        let file_id = Uuid::new_v4().to_string();
        let state = UploadState::new(
            file_id.clone(),
            file_name.to_string(),
            file_size,
            total_chunks,
            client_id.to_string(),
        );
        self.storage.put_upload(&state).await?;

        sender.uploads.insert(file_id.clone());
        self.storage.put_session(&sender).await?;

        for mut receiver in receivers {
            receiver.downloads.insert(file_id.clone());
            if let Err(e) = self.storage.put_session(&receiver).await {
                tracing::warn!(
                    receiver = receiver.client_id.as_str(),
                    error = %e,
                    "Failed to register download"
                );
                continue;
            }
            self.coordinator
                .route_to_client(
                    &receiver.client_id,
                    ServerEvent::FileTransferStarted {
                        file_id: file_id.clone(),
                        file_name: file_name.to_string(),
                        file_size,
                        total_chunks,
                    },
                )
                .await;
        }

        tracing::info!(
            file_id = file_id.as_str(),
            sender = client_id,
            file_name = file_name,
            file_size = file_size,
            total_chunks = total_chunks,
            "Upload initialized"
        );

        Ok((file_id, 0))
    }

    // ── Chunk ingest ──────────────────────────────────────────────────────

    /// Ingest one chunk and fan it out. The caller's reply to the sender
    /// is the flow-control signal, so this path only does relay + persist.
    pub async fn handle_chunk(
        &self,
        client_id: &str,
        file_id: &str,
        chunk_index: u32,
        chunk: &Blob,
        checksum: Option<&str>,
    ) -> Result<(), RelayError> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;

        let mut state = self
            .storage
            .get_upload(file_id)
            .await?
            .ok_or_else(|| RelayError::UploadNotFound(file_id.to_string()))?;

        match state.status {
            UploadStatus::Uploading => {}
            UploadStatus::Cancelled => {
                return Err(RelayError::UploadFailed("upload was cancelled".to_string()))
            }
            UploadStatus::Paused => {
                return Err(RelayError::UploadFailed("upload is paused".to_string()))
            }
            UploadStatus::Completed | UploadStatus::Failed => {
                return Err(RelayError::UploadFailed(format!(
                    "upload is no longer active ({:?})",
                    state.status
                )))
            }
        }

        if chunk_index >= state.total_chunks {
            return Err(RelayError::BadRequest(format!(
                "chunk index {} out of range 0..{}",
                chunk_index, state.total_chunks
            )));
        }

        if self.config.checksums_enabled {
            let digest = hex::encode(Sha256::digest(&chunk.0));
            if let Some(expected) = checksum {
                if !expected.eq_ignore_ascii_case(&digest) {
                    tracing::warn!(
                        file_id = file_id,
                        chunk_index = chunk_index,
                        "Chunk checksum mismatch"
                    );
                    return Err(RelayError::ChecksumMismatch { chunk_index });
                }
            }
            state.chunk_checksums.insert(chunk_index, digest);
        }

        let now_ms = Utc::now().timestamp_millis();
        let fresh = state.record_chunk(chunk_index);
        if fresh {
            state.pending_acks.insert(
                chunk_index,
                PendingAck {
                    timestamp: now_ms,
                    retries: 0,
                },
            );
        }

        self.coordinator
            .route_to_client(
                &state.client_id,
                ServerEvent::ChunkUploaded {
                    file_id: file_id.to_string(),
                    chunk_index,
                    progress: state.progress_percent(),
                    uploaded_chunks: state.uploaded_chunks.len() as u32,
                    total_chunks: state.total_chunks,
                },
            )
            .await;

        // Relay fresh chunks, and re-sent chunks that are still pending —
        // an already-acknowledged duplicate must not reach the receiver
        // twice.
        let should_relay = fresh || state.pending_acks.contains_key(&chunk_index);
        if should_relay {
            self.fan_out_chunk(&mut state, chunk_index, chunk, client_id, now_ms)
                .await;
        }

        if self.is_complete(&state) {
            self.complete_upload(&mut state).await;
        }

        if let Err(e) = self.storage.put_upload(&state).await {
            // The ACK/retry machinery absorbs a lost write.
            tracing::warn!(file_id = file_id, error = %e, "Upload state write failed");
        }

        Ok(())
    }

    /// Relay a chunk to every recipient still subscribed to the file, and
    /// synthesize the sender-side acknowledgment on fan-out success.
    async fn fan_out_chunk(
        &self,
        state: &mut UploadState,
        chunk_index: u32,
        chunk: &Blob,
        sender_id: &str,
        now_ms: i64,
    ) {
        let peers = match latest_session(self.storage.as_ref(), sender_id).await {
            Some(session) => match &session.share_id {
                Some(share_id) => match self.storage.get_share(share_id).await {
                    Ok(Some(share)) => share.peers_of(sender_id),
                    _ => Vec::new(),
                },
                None => Vec::new(),
            },
            None => Vec::new(),
        };

        for peer in peers {
            match self
                .storage
                .is_download_cancelled(&state.file_id, &peer)
                .await
            {
                Ok(true) => {
                    tracing::debug!(
                        file_id = state.file_id.as_str(),
                        receiver = peer.as_str(),
                        "Skipping cancelled receiver"
                    );
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Cancellation check failed");
                }
            }

            // Only recipients whose download set still holds the file.
            let Some(peer_session) = latest_session(self.storage.as_ref(), &peer).await else {
                continue;
            };
            if !peer_session.downloads.contains(&state.file_id) {
                continue;
            }

            let delivered = self
                .coordinator
                .route_to_client(
                    &peer,
                    ServerEvent::ChunkReceived {
                        file_id: state.file_id.clone(),
                        chunk_index,
                        chunk: chunk.clone(),
                        total_chunks: state.total_chunks,
                    },
                )
                .await;

            if delivered {
                // Server-synthesized ACK: fan-out succeeded, so clear the
                // pending entry and tell the sender. A failed fan-out
                // leaves the entry for the retry scanner.
                state.pending_acks.remove(&chunk_index);
                state.last_ack_time = Some(now_ms);
                self.coordinator
                    .route_to_client(
                        &state.client_id,
                        ServerEvent::ChunkAcknowledged {
                            file_id: state.file_id.clone(),
                            chunk_index,
                        },
                    )
                    .await;
            }
        }
    }

    // ── Acknowledgments ───────────────────────────────────────────────────

    /// Receiver-origin `chunk-acknowledged`. Idempotent.
    pub async fn handle_receiver_ack(&self, file_id: &str, chunk_index: u32) {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;

        let mut state = match self.storage.get_upload(file_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                tracing::debug!(file_id = file_id, "ACK for unknown upload dropped");
                return;
            }
            Err(e) => {
                tracing::warn!(file_id = file_id, error = %e, "ACK state read failed");
                return;
            }
        };

        if state.pending_acks.remove(&chunk_index).is_none() {
            return;
        }
        state.last_ack_time = Some(Utc::now().timestamp_millis());
        state.last_update = Utc::now();

        if self.is_complete(&state) {
            self.complete_upload(&mut state).await;
        }

        if let Err(e) = self.storage.put_upload(&state).await {
            tracing::warn!(file_id = file_id, error = %e, "ACK state write failed");
        }
    }

    /// Periodic pending-ack scan: retry stalled chunks, fail uploads that
    /// exhausted the retry budget.
    pub async fn scan_pending_acks(&self) {
        let file_ids = match self.storage.active_upload_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "Active upload listing failed");
                return;
            }
        };

        for file_id in file_ids {
            let lock = self.file_lock(&file_id);
            let _guard = lock.lock().await;

            let mut state = match self.storage.get_upload(&file_id).await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(file_id = file_id.as_str(), error = %e, "Scan read failed");
                    continue;
                }
            };
            if state.status != UploadStatus::Uploading {
                continue;
            }

            let now_ms = Utc::now().timestamp_millis();
            let timeout_ms = self.config.ack_timeout_ms as i64;
            let mut retries = Vec::new();
            let mut failed = Vec::new();

            for (chunk_index, ack) in state.pending_acks.iter_mut() {
                if now_ms - ack.timestamp <= timeout_ms {
                    continue;
                }
                if ack.retries < self.config.max_retries {
                    ack.retries += 1;
                    ack.timestamp = now_ms;
                    retries.push((*chunk_index, ack.retries));
                } else {
                    failed.push(*chunk_index);
                }
            }

            for (chunk_index, attempt) in &retries {
                tracing::debug!(
                    file_id = file_id.as_str(),
                    chunk_index = chunk_index,
                    attempt = attempt,
                    "Requesting chunk retry"
                );
                self.coordinator
                    .route_to_client(
                        &state.client_id,
                        ServerEvent::ChunkRetry {
                            file_id: file_id.clone(),
                            chunk_index: *chunk_index,
                            attempt: *attempt,
                        },
                    )
                    .await;
            }

            if !failed.is_empty() {
                self.fail_upload(&mut state, failed).await;
            }

            if !retries.is_empty() || state.status != UploadStatus::Uploading {
                if let Err(e) = self.storage.put_upload(&state).await {
                    tracing::warn!(file_id = file_id.as_str(), error = %e, "Scan write failed");
                }
            }
        }
    }

    // ── Cancellation & confirmation ───────────────────────────────────────

    /// A receiver opts out of the transfer; later chunks skip it.
    pub async fn cancel_download(&self, client_id: &str, file_id: &str) {
        if let Err(e) = self.storage.add_cancelled_download(file_id, client_id).await {
            tracing::warn!(file_id = file_id, error = %e, "Cancellation write failed");
        }

        self.drop_download(client_id, file_id).await;

        tracing::info!(file_id = file_id, client = client_id, "Download cancelled");

        self.coordinator
            .route_to_client(
                client_id,
                ServerEvent::DownloadCancelled {
                    file_id: file_id.to_string(),
                },
            )
            .await;
    }

    /// A receiver finished reassembly; tell the sender. The upload state
    /// is authoritative for who that is, with the share roster as the
    /// fallback once the state has been reaped.
    pub async fn confirm_download(
        &self,
        client_id: &str,
        file_id: &str,
        file_name: &str,
        share_id: &str,
    ) {
        self.drop_download(client_id, file_id).await;

        let sender = match self.storage.get_upload(file_id).await {
            Ok(Some(state)) => Some(state.client_id),
            _ => match self.storage.get_share(share_id).await {
                Ok(Some(share)) => share.peers_of(client_id).into_iter().next(),
                _ => None,
            },
        };

        let Some(sender) = sender else {
            tracing::debug!(
                file_id = file_id,
                "Download confirmation with no reachable sender"
            );
            return;
        };

        self.coordinator
            .route_to_client(
                &sender,
                ServerEvent::DownloadConfirmed {
                    file_id: file_id.to_string(),
                    file_name: file_name.to_string(),
                },
            )
            .await;
    }

    /// Remove a file from every session download set of a client.
    async fn drop_download(&self, client_id: &str, file_id: &str) {
        let sessions = match self.storage.sessions_for_client(client_id).await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(client = client_id, error = %e, "Session lookup failed");
                return;
            }
        };
        for mut session in sessions {
            if session.downloads.remove(file_id) {
                if let Err(e) = self.storage.put_session(&session).await {
                    tracing::warn!(client = client_id, error = %e, "Download drop write failed");
                }
            }
        }
    }

    // ── Completion & failure ──────────────────────────────────────────────

    fn is_complete(&self, state: &UploadState) -> bool {
        state.status == UploadStatus::Uploading
            && state.all_chunks_uploaded()
            && state.pending_acks.is_empty()
    }

    async fn complete_upload(&self, state: &mut UploadState) {
        state.status = UploadStatus::Completed;
        state.last_update = Utc::now();
        let duration = (Utc::now() - state.start_time).num_milliseconds();

        tracing::info!(
            file_id = state.file_id.as_str(),
            duration_ms = duration,
            "Upload complete"
        );

        self.release_budgets(state).await;

        if let Err(e) = self.storage.incr_counter("files_sent").await {
            tracing::debug!(error = %e, "files_sent counter update failed");
        }
        if let Err(e) = self.storage.clear_cancelled(&state.file_id).await {
            tracing::debug!(error = %e, "Cancellation cleanup failed");
        }

        self.coordinator
            .route_to_client(
                &state.client_id,
                ServerEvent::UploadComplete {
                    file_id: state.file_id.clone(),
                    file_name: state.file_name.clone(),
                    file_size: state.file_size,
                    duration,
                },
            )
            .await;
    }

    async fn fail_upload(&self, state: &mut UploadState, failed_chunks: Vec<u32>) {
        state.status = UploadStatus::Failed;
        state.last_update = Utc::now();

        tracing::warn!(
            file_id = state.file_id.as_str(),
            failed = failed_chunks.len(),
            "Transfer failed, retry budget exhausted"
        );

        self.release_budgets(state).await;

        self.coordinator
            .route_to_client(
                &state.client_id,
                ServerEvent::TransferFailed {
                    file_id: state.file_id.clone(),
                    reason: format!(
                        "{} chunks unacknowledged after {} retries",
                        failed_chunks.len(),
                        self.config.max_retries
                    ),
                    failed_chunks,
                },
            )
            .await;
    }

    /// Free the transfer budgets a terminal upload was holding.
    async fn release_budgets(&self, state: &UploadState) {
        let sessions = match self.storage.sessions_for_client(&state.client_id).await {
            Ok(sessions) => sessions,
            Err(_) => Vec::new(),
        };
        for mut session in sessions {
            if session.uploads.remove(&state.file_id) {
                if let Err(e) = self.storage.put_session(&session).await {
                    tracing::debug!(error = %e, "Upload budget release failed");
                }
            }
        }
    }

    // ── Maintenance ───────────────────────────────────────────────────────

    /// Reap finished and silent uploads. Timer body.
    pub async fn reap_uploads(&self) {
        let file_ids = match self.storage.all_upload_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "Upload listing failed");
                return;
            }
        };

        let now = Utc::now();
        for file_id in file_ids {
            let Ok(Some(state)) = self.storage.get_upload(&file_id).await else {
                continue;
            };
            let idle_secs = (now - state.last_update).num_seconds();

            let reap = if state.status.is_terminal() {
                idle_secs > COMPLETED_UPLOAD_REAP_SECS
            } else {
                idle_secs > SILENT_UPLOAD_REAP_SECS
            };
            if !reap {
                continue;
            }

            tracing::debug!(
                file_id = file_id.as_str(),
                status = ?state.status,
                idle_secs = idle_secs,
                "Reaping upload"
            );
            if let Err(e) = self.storage.remove_upload(&file_id).await {
                tracing::warn!(file_id = file_id.as_str(), error = %e, "Upload reap failed");
                continue;
            }
            self.file_locks.remove(&file_id);
        }
    }

    /// Progress snapshot for the HTTP surface.
    pub async fn upload_snapshot(&self, file_id: &str) -> Result<UploadState, RelayError> {
        self.storage
            .get_upload(file_id)
            .await?
            .ok_or_else(|| RelayError::UploadNotFound(file_id.to_string()))
    }
}
