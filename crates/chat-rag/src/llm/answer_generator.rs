//! Chat-completion call for the final answer

use std::sync::Arc;
use tracing::{debug, info};

use super::{ChatModel, CompletionRequest, RetryPolicy, TokenUsage};
use crate::context_engine::PromptBuilder;

/// Fixed generation parameters
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedAnswer {
    pub content: String,
    pub role: String,
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl GeneratedAnswer {
    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

pub struct AnswerGenerator {
    model: Arc<dyn ChatModel>,
    retry: RetryPolicy,
    config: GenerationConfig,
}

impl AnswerGenerator {
    pub fn new(model: Arc<dyn ChatModel>, retry: RetryPolicy, config: GenerationConfig) -> Self {
        Self { model, retry, config }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Ask the model to answer `question` under `system_prompt`.
    pub async fn generate(&self, system_prompt: &str, question: &str) -> anyhow::Result<GeneratedAnswer> {
        let request = CompletionRequest {
            messages: PromptBuilder::build_messages(system_prompt, question),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        debug!("Generating answer (system prompt {} chars)", system_prompt.len());

        let model = &self.model;
        let request = &request;
        let completion = self
            .retry
            .run("chat completion", || async move { model.complete(request).await })
            .await?;

        info!(
            "Answer generated: {} tokens ({} prompt, {} completion)",
            completion.usage.total_tokens, completion.usage.prompt_tokens, completion.usage.completion_tokens
        );

        Ok(GeneratedAnswer {
            content: completion.content,
            role: completion.role,
            total_tokens: completion.usage.total_tokens,
            prompt_tokens: completion.usage.prompt_tokens,
            completion_tokens: completion.usage.completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::PromptMessage;
    use crate::test_support::FakeChatModel;
    use std::time::Duration;

    #[tokio::test]
    async fn test_generate_sends_system_then_user() {
        let model = Arc::new(FakeChatModel::answering("Noon.\nSources:\n[1] @a in #b: c").with_usage(300, 45));
        let generator = AnswerGenerator::new(
            model.clone(),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1)),
            GenerationConfig::default(),
        );

        let answer = generator.generate("rules", "when?").await.unwrap();

        assert!(answer.content.starts_with("Noon."));
        assert_eq!(answer.role, "assistant");
        assert_eq!(
            answer.usage(),
            TokenUsage { prompt_tokens: 300, completion_tokens: 45, total_tokens: 345 }
        );
        let request = model.last_request().unwrap();
        assert_eq!(request.messages[0], PromptMessage::system("rules"));
        assert_eq!(request.messages[1], PromptMessage::user("when?"));
        assert_eq!(request.max_tokens, 1000);
    }

    #[tokio::test]
    async fn test_generate_fails_after_retries() {
        let model = Arc::new(FakeChatModel::answering("unused").failing_first(10));
        let generator = AnswerGenerator::new(
            model.clone(),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1)),
            GenerationConfig::default(),
        );

        assert!(generator.generate("rules", "q").await.is_err());
        assert_eq!(model.calls(), 3);
    }
}
