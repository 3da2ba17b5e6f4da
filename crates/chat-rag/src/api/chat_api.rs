//! Question answering endpoint

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use tracing::info;

use super::{require_user, ApiError};
use crate::context_engine::ProcessedResponse;
use crate::shared_state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub channel_id: Option<String>,
}

/// POST /ai/chat
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ProcessedResponse>, ApiError> {
    let user_id = require_user(&headers)?;
    let Json(payload) = payload?;
    let query = payload.query.trim();
    if query.is_empty() {
        return Err(ApiError::bad_request("Query cannot be empty"));
    }
    let channel_id = payload.channel_id.as_deref().filter(|c| !c.is_empty());

    info!("Chat request from {} (channel {:?})", user_id, channel_id);
    let response = state.pipeline.answer(&user_id, query, channel_id).await?;
    Ok(Json(response))
}
