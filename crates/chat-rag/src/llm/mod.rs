//! Model provider seams - embeddings and chat completions
//!
//! The pipeline only talks to the [`EmbeddingModel`] and [`ChatModel`]
//! traits. [`LlmClient`] implements both against an OpenAI-compatible HTTP
//! endpoint; tests substitute in-process fakes.

pub mod answer_generator;
pub mod client;
pub mod embedding_provider;
pub mod retry;

pub use answer_generator::{AnswerGenerator, GeneratedAnswer, GenerationConfig};
pub use client::LlmClient;
pub use embedding_provider::{EmbeddingProvider, EmbeddingProviderConfig};
pub use retry::{RetryObserver, RetryPolicy};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One role-tagged message sent to the chat model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Token usage counters reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub role: String,
    pub usage: TokenUsage,
}

/// Text embedding endpoint: one fixed-dimension vector per input, in order.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Chat completion endpoint.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<ChatCompletion>;
}
