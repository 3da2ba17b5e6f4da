//! Semantic search endpoint - ranked messages without generation

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{require_user, ApiError};
use crate::context_engine::retriever::DEFAULT_SEARCH_LIMIT;
use crate::context_engine::SearchResult;
use crate::shared_state::AppState;

const MAX_SEARCH_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total: usize,
}

/// POST /ai/search
///
/// Counts against the caller's rate limit; the query is embedded.
pub async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let user_id = require_user(&headers)?;
    let Json(payload) = payload?;
    if payload.query.trim().is_empty() {
        return Err(ApiError::bad_request("Query cannot be empty"));
    }
    state.gate.check_rate_limit(&user_id).await?;

    let limit = payload
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);
    let channel_id = payload.channel_id.as_deref().filter(|c| !c.is_empty());

    let results = state
        .retriever
        .search(&payload.query, channel_id, limit)
        .await
        .map_err(|e| ApiError::internal("Search failed", &e))?;
    debug!("Search by {} returned {} results", user_id, results.len());

    Ok(Json(SearchResponse {
        total: results.len(),
        results,
    }))
}
