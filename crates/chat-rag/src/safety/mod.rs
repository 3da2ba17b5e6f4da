//! Policy wrapper around answer requests: rate limit, daily budgets,
//! timeout and output redaction.

pub mod budget;
pub mod metrics_store;
pub mod rate_limiter;
pub mod redaction;

pub use budget::{BudgetPolicy, TokenBudget};
pub use metrics_store::{DailyUsage, InMemorySafetyMetricsStore, SafetyMetricsStore, WindowState};
pub use rate_limiter::{RateLimitStatus, RateLimiter, RATE_WINDOW_SECS};
pub use redaction::{redact_response, redact_text, REDACTION_NOTE};

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::context_engine::ProcessedResponse;
use crate::error::SafetyError;
use crate::llm::TokenUsage;

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub requests_per_minute: u32,
    pub daily_token_limit: u64,
    pub daily_cost_limit: f64,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
    pub request_timeout: Duration,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 20,
            daily_token_limit: 100_000,
            daily_cost_limit: 1.0,
            input_price_per_1k: 0.00015,
            output_price_per_1k: 0.0006,
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl SafetyConfig {
    fn budget_policy(&self) -> BudgetPolicy {
        BudgetPolicy {
            daily_token_limit: self.daily_token_limit,
            daily_cost_limit: self.daily_cost_limit,
            input_price_per_1k: self.input_price_per_1k,
            output_price_per_1k: self.output_price_per_1k,
        }
    }
}

/// A processed answer plus what it cost at the provider
#[derive(Debug, Clone)]
pub struct MeteredResponse {
    pub response: ProcessedResponse,
    pub usage: TokenUsage,
}

pub struct SafetyGate {
    config: SafetyConfig,
    store: Arc<dyn SafetyMetricsStore>,
    limiter: RateLimiter,
    budget: TokenBudget,
}

impl SafetyGate {
    /// Gate backed by process-local counters.
    pub fn new(config: SafetyConfig) -> Self {
        Self::with_store(config, Arc::new(InMemorySafetyMetricsStore::new()))
    }

    pub fn with_store(config: SafetyConfig, store: Arc<dyn SafetyMetricsStore>) -> Self {
        let limiter = RateLimiter::new(Arc::clone(&store), config.requests_per_minute);
        let budget = TokenBudget::new(Arc::clone(&store), config.budget_policy());
        Self { config, store, limiter, budget }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Run `answer` under the configured timeout.
    pub async fn guard<F>(
        &self,
        user_id: &str,
        estimated_tokens: u64,
        answer: F,
    ) -> Result<ProcessedResponse, SafetyError>
    where
        F: Future<Output = anyhow::Result<MeteredResponse>>,
    {
        self.guard_with_timeout(user_id, estimated_tokens, self.config.request_timeout, answer)
            .await
    }

    /// Rate limit, pre-flight budget, timeout, post-hoc budget, redaction.
    ///
    /// On timeout `answer` is dropped, which cancels any request it has in
    /// flight. Usage is only recorded for answers that completed.
    pub async fn guard_with_timeout<F>(
        &self,
        user_id: &str,
        estimated_tokens: u64,
        timeout: Duration,
        answer: F,
    ) -> Result<ProcessedResponse, SafetyError>
    where
        F: Future<Output = anyhow::Result<MeteredResponse>>,
    {
        self.check_rate_limit(user_id).await?;

        let today = Utc::now().date_naive();
        self.budget.preflight(user_id, today, estimated_tokens).await?;

        let metered = match tokio::time::timeout(timeout, answer).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Answer for user {} timed out after {:?}", user_id, timeout);
                return Err(SafetyError::TimedOut(timeout));
            }
        };

        self.budget.record(user_id, today, &metered.usage).await?;

        let mut response = metered.response;
        if redact_response(&mut response) {
            info!("Redacted sensitive content in answer for user {}", user_id);
        }
        Ok(response)
    }

    /// Count a request against the user's window.
    pub async fn check_rate_limit(&self, user_id: &str) -> Result<RateLimitStatus, SafetyError> {
        self.limiter.check_at(user_id, Utc::now()).await
    }

    /// Window state for response headers; does not count a request.
    pub async fn rate_limit_status(&self, user_id: &str) -> anyhow::Result<RateLimitStatus> {
        self.limiter.status_at(user_id, Utc::now()).await
    }

    pub async fn daily_usage(&self, user_id: &str) -> anyhow::Result<DailyUsage> {
        self.store.daily_usage(user_id, Utc::now().date_naive()).await
    }

    pub async fn reset_user(&self, user_id: &str) -> anyhow::Result<()> {
        self.store.reset(user_id).await
    }
}
