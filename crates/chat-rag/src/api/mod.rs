//! API module - HTTP surface of the answer pipeline and the indexer

pub mod chat_api;
pub mod index_api;
pub mod search_api;

pub use chat_api::{chat, ChatRequest};
pub use index_api::{delete_message, index_message, index_status, start_backfill, BackfillRequest};
pub use search_api::{search, SearchRequest, SearchResponse};

use axum::{
    extract::{rejection::JsonRejection, MatchedPath, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, warn};

use crate::error::SafetyError;
use crate::metrics;
use crate::shared_state::AppState;

/// Set by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Error rendered as `{"error": message}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Logs the cause and hides it from the client.
    pub fn internal(context: &str, err: &anyhow::Error) -> Self {
        error!("{}: {:#}", context, err);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SafetyError> for ApiError {
    fn from(err: SafetyError) -> Self {
        match err {
            SafetyError::RateLimited { .. }
            | SafetyError::TokenLimitExceeded { .. }
            | SafetyError::CostLimitExceeded { .. } => {
                warn!("Request refused: {}", err);
                Self::new(StatusCode::TOO_MANY_REQUESTS, err.to_string())
            }
            SafetyError::TimedOut(_) => {
                warn!("{}", err);
                Self::new(StatusCode::GATEWAY_TIMEOUT, "The request timed out, please try again")
            }
            SafetyError::Pipeline(inner) => {
                error!("Answer pipeline failed: {:#}", inner);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to process your question, please try again later",
                )
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        warn!("Rejected request body: {}", rejection.body_text());
        Self::new(rejection.status(), rejection.body_text())
    }
}

/// Caller identity from the auth header; 401 when absent or blank.
pub fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Missing X-User-Id header"))
}

/// Adds `X-RateLimit-*` headers and counts the request.
pub async fn rate_limit_headers(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let user = require_user(request.headers()).ok();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let mut response = next.run(request).await;
    metrics::inc_request(&route, response.status().as_str());

    let status = match user {
        Some(user) => state.gate.rate_limit_status(&user).await,
        None => state.gate.rate_limit_status("").await,
    };
    match status {
        Ok(status) => {
            let headers = response.headers_mut();
            headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(status.limit));
            headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(status.remaining));
            headers.insert(RATE_LIMIT_RESET, HeaderValue::from(status.reset_at.timestamp()));
        }
        Err(e) => warn!("Could not read rate limit status: {}", e),
    }
    response
}
