//! Daily token and cost budgets

use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{debug, warn};

use super::metrics_store::{DailyUsage, SafetyMetricsStore};
use crate::error::SafetyError;
use crate::llm::TokenUsage;

#[derive(Debug, Clone)]
pub struct BudgetPolicy {
    pub daily_token_limit: u64,
    pub daily_cost_limit: f64,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
}

impl BudgetPolicy {
    /// Dollar cost of one completion.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        usage.prompt_tokens as f64 / 1000.0 * self.input_price_per_1k
            + usage.completion_tokens as f64 / 1000.0 * self.output_price_per_1k
    }
}

fn billable_tokens(usage: &TokenUsage) -> u64 {
    usage
        .total_tokens
        .max(usage.prompt_tokens + usage.completion_tokens)
}

pub struct TokenBudget {
    store: Arc<dyn SafetyMetricsStore>,
    policy: BudgetPolicy,
}

impl TokenBudget {
    pub fn new(store: Arc<dyn SafetyMetricsStore>, policy: BudgetPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &BudgetPolicy {
        &self.policy
    }

    /// Reject before any model call if `estimated_tokens` would exceed
    /// today's token budget, or the cost budget is already spent.
    pub async fn preflight(
        &self,
        user_id: &str,
        day: NaiveDate,
        estimated_tokens: u64,
    ) -> Result<DailyUsage, SafetyError> {
        let usage = self.store.daily_usage(user_id, day).await?;

        if usage.tokens + estimated_tokens > self.policy.daily_token_limit {
            warn!(
                "Pre-flight token check failed for {}: {} used + {} estimated",
                user_id, usage.tokens, estimated_tokens
            );
            return Err(SafetyError::TokenLimitExceeded {
                used: usage.tokens,
                limit: self.policy.daily_token_limit,
            });
        }
        if usage.cost >= self.policy.daily_cost_limit {
            return Err(SafetyError::CostLimitExceeded {
                spent: usage.cost,
                limit: self.policy.daily_cost_limit,
            });
        }
        Ok(usage)
    }

    /// Add actual usage, then fail if a daily limit is now exceeded.
    pub async fn record(
        &self,
        user_id: &str,
        day: NaiveDate,
        usage: &TokenUsage,
    ) -> Result<DailyUsage, SafetyError> {
        let tokens = billable_tokens(usage);
        let cost = self.policy.cost(usage);
        let totals = self.store.add_usage(user_id, day, tokens, cost).await?;
        debug!(
            "User {} spent {} tokens (${:.5}); today {} tokens, ${:.4}",
            user_id, tokens, cost, totals.tokens, totals.cost
        );

        if totals.tokens > self.policy.daily_token_limit {
            return Err(SafetyError::TokenLimitExceeded {
                used: totals.tokens,
                limit: self.policy.daily_token_limit,
            });
        }
        if totals.cost > self.policy.daily_cost_limit {
            return Err(SafetyError::CostLimitExceeded {
                spent: totals.cost,
                limit: self.policy.daily_cost_limit,
            });
        }
        Ok(totals)
    }
}
