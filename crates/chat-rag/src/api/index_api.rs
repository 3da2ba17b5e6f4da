//! Indexing endpoints - realtime feed, deletion, backfill and status

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use super::ApiError;
use crate::memory_db::{EmbeddingStats, StoredMessage};
use crate::shared_state::AppState;
use crate::vector_index::IndexDescription;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillRequest {
    #[serde(default)]
    pub resume_from_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatusResponse {
    pub embeddings: EmbeddingStats,
    pub queue_depth: usize,
    pub indexer_processing: bool,
    pub backfill_running: bool,
    pub index: IndexDescription,
}

/// POST /ai/index/messages
///
/// Stores a message from the realtime feed and queues it for embedding.
pub async fn index_message(
    State(state): State<AppState>,
    message: Result<Json<StoredMessage>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(message) = message?;
    if message.id.trim().is_empty() {
        return Err(ApiError::bad_request("Message id cannot be empty"));
    }

    state
        .db
        .messages
        .insert_message(&message)
        .map_err(|e| ApiError::internal("Failed to store message", &e))?;
    let id = message.id.clone();
    let queued = state
        .indexer
        .enqueue(message)
        .await
        .map_err(|e| ApiError::internal("Failed to queue message", &e))?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "messageId": id, "queued": queued }))))
}

/// DELETE /ai/index/messages/:id
pub async fn delete_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed_vector = state
        .writer
        .remove(&id)
        .await
        .map_err(|e| ApiError::internal("Failed to remove vector", &e))?;
    let removed_message = state
        .db
        .messages
        .delete_message(&id)
        .map_err(|e| ApiError::internal("Failed to delete message", &e))?;

    if !removed_vector && !removed_message {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "Message not found"));
    }
    info!("Deleted message {} (vector removed: {})", id, removed_vector);
    Ok(Json(json!({ "messageId": id, "removed": true })))
}

/// POST /ai/index/backfill
///
/// Starts a backfill in the background. Without `resumeFromId` it continues
/// from the stored checkpoint.
pub async fn start_backfill(
    State(state): State<AppState>,
    payload: Option<Json<BackfillRequest>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    if !state.try_start_backfill() {
        return Err(ApiError::new(StatusCode::CONFLICT, "A backfill is already running"));
    }

    let resume_from = request.resume_from_id.filter(|id| !id.is_empty());
    let response = json!({ "started": true, "resumeFromId": resume_from });

    let job_state = state.clone();
    tokio::spawn(async move {
        let log_progress = |stats: &crate::indexing::BackfillStats| {
            info!(
                "Backfill progress: {} completed, {} failed, {} skipped of {}",
                stats.completed, stats.failed, stats.skipped, stats.total
            );
        };
        let result = match resume_from.as_deref() {
            Some(id) => job_state.backfill.process(Some(id), Some(&log_progress)).await,
            None => job_state.backfill.process_from_checkpoint(Some(&log_progress)).await,
        };
        match result {
            Ok(stats) => info!("Backfill finished: {:?}", stats),
            Err(e) => error!("Backfill aborted: {:#}", e),
        }
        job_state.finish_backfill();
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /ai/index/status
pub async fn index_status(State(state): State<AppState>) -> Result<Json<IndexStatusResponse>, ApiError> {
    let embeddings = state
        .db
        .embeddings
        .get_stats()
        .map_err(|e| ApiError::internal("Failed to read embedding stats", &e))?;
    let queue_depth = state
        .indexer
        .queue_len()
        .await
        .map_err(|e| ApiError::internal("Failed to read queue", &e))?;
    let index = state
        .index
        .describe()
        .await
        .map_err(|e| ApiError::internal("Failed to describe index", &e))?;

    Ok(Json(IndexStatusResponse {
        embeddings,
        queue_depth,
        indexer_processing: state.indexer.is_processing(),
        backfill_running: state.is_backfill_running(),
        index,
    }))
}
