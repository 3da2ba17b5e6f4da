//! Error types callers need to branch on.
//!
//! Everything else in the crate propagates `anyhow::Error`.

use std::time::Duration;
use thiserror::Error;

/// Policy failures raised by the safety gate around an answer request.
#[derive(Error, Debug)]
pub enum SafetyError {
    /// Too many requests from one user inside the sliding window
    #[error("Rate limit exceeded: {limit} requests per minute, retry in {retry_after_secs}s")]
    RateLimited { limit: u32, retry_after_secs: u64 },

    /// The answer did not complete in time
    #[error("Request timed out after {0:?}")]
    TimedOut(Duration),

    /// Daily token budget exhausted
    #[error("Daily token limit exceeded: {used} of {limit} tokens used")]
    TokenLimitExceeded { used: u64, limit: u64 },

    /// Daily cost budget exhausted
    #[error("Daily cost limit exceeded: ${spent:.4} of ${limit:.2} spent")]
    CostLimitExceeded { spent: f64, limit: f64 },

    /// Retrieval, generation or storage failed underneath the gate
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] anyhow::Error),
}

impl SafetyError {
    /// Short machine-readable name used for metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            SafetyError::RateLimited { .. } => "rate_limited",
            SafetyError::TimedOut(_) => "timed_out",
            SafetyError::TokenLimitExceeded { .. } => "token_limit",
            SafetyError::CostLimitExceeded { .. } => "cost_limit",
            SafetyError::Pipeline(_) => "pipeline",
        }
    }
}

/// Fatal misconfiguration of the vector index detected at startup.
#[derive(Error, Debug, PartialEq)]
pub enum IndexConfigError {
    /// The existing index was built for a different embedding size
    #[error("Vector index dimension mismatch: configured {configured}, index has {index}")]
    DimensionMismatch { configured: usize, index: usize },

    /// The embedding dimension is unusable
    #[error("Invalid embedding dimension: {0}")]
    InvalidDimension(usize),
}
