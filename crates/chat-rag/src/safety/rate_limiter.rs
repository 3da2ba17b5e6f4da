//! Sliding-window request limiter

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use super::metrics_store::SafetyMetricsStore;
use crate::error::SafetyError;

pub const RATE_WINDOW_SECS: i64 = 60;

/// Values for the `X-RateLimit-*` headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    /// When the oldest request in the window falls out of it
    pub reset_at: DateTime<Utc>,
}

pub struct RateLimiter {
    store: Arc<dyn SafetyMetricsStore>,
    limit: u32,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SafetyMetricsStore>, limit: u32) -> Self {
        Self { store, limit }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Record a request at `now`, or reject it when the window is full.
    pub async fn check_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<RateLimitStatus, SafetyError> {
        let window = Duration::seconds(RATE_WINDOW_SECS);
        let state = self
            .store
            .try_record_request(user_id, now, now - window, self.limit)
            .await?;

        let reset_at = state.oldest.map_or(now + window, |oldest| oldest + window);
        if !state.allowed {
            let retry_after_secs = (reset_at - now).num_seconds().max(1) as u64;
            warn!("Rate limit hit for user {} ({} in window)", user_id, state.count);
            return Err(SafetyError::RateLimited {
                limit: self.limit,
                retry_after_secs,
            });
        }

        Ok(RateLimitStatus {
            limit: self.limit,
            remaining: self.limit.saturating_sub(state.count),
            reset_at,
        })
    }

    /// Current window without recording a request.
    pub async fn status_at(&self, user_id: &str, now: DateTime<Utc>) -> anyhow::Result<RateLimitStatus> {
        let window = Duration::seconds(RATE_WINDOW_SECS);
        let state = self.store.peek_requests(user_id, now - window).await?;
        Ok(RateLimitStatus {
            limit: self.limit,
            remaining: self.limit.saturating_sub(state.count),
            reset_at: state.oldest.map_or(now + window, |oldest| oldest + window),
        })
    }
}
