//! HTTP client for an OpenAI-compatible model provider.
//!
//! Serves both `/v1/embeddings` and `/v1/chat/completions`. Non-2xx answers
//! become errors so the retry policy above this layer can decide what to do.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{ChatCompletion, ChatModel, CompletionRequest, EmbeddingModel, PromptMessage, TokenUsage};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<PromptMessage>,
}

pub struct LlmClient {
    base_url: String,
    api_key: Option<String>,
    embedding_model: String,
    chat_model: String,
    http_client: reqwest::Client,
}

impl LlmClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        embedding_model: impl Into<String>,
        chat_model: impl Into<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!("LLM client initialized with backend: {}", base_url);
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            embedding_model: embedding_model.into(),
            chat_model: chat_model.into(),
            http_client,
        })
    }

    pub fn from_config(cfg: &crate::config::Config) -> anyhow::Result<Self> {
        Self::new(
            cfg.llm_base_url.clone(),
            cfg.llm_api_key.clone(),
            cfg.embedding_model.clone(),
            cfg.chat_model.clone(),
            Duration::from_secs(cfg.provider_timeout_seconds),
        )
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        let builder = self.http_client.post(url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl EmbeddingModel for LlmClient {
    async fn embed_texts(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Generating embeddings for {} text(s)", texts.len());
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: texts,
        };
        let response = self
            .post(self.embeddings_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Embedding request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Embedding endpoint returned {}: {}", status, body));
        }
        let mut embedding_response: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse embedding response: {}", e))?;

        // Providers may answer out of order; `index` restores input order.
        embedding_response
            .data
            .sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        let embeddings: Vec<Vec<f32>> = embedding_response
            .data
            .into_iter()
            .map(|d| d.embedding)
            .collect();

        if embeddings.len() != texts.len() {
            return Err(anyhow::anyhow!(
                "Embedding endpoint returned {} vectors for {} inputs",
                embeddings.len(),
                texts.len()
            ));
        }
        debug!(
            "Generated {} embeddings (dim={})",
            embeddings.len(),
            embeddings.first().map(|e| e.len()).unwrap_or(0)
        );
        Ok(embeddings)
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<ChatCompletion> {
        debug!("Requesting chat completion ({} messages)", request.messages.len());
        let body = ChatCompletionRequest {
            model: &self.chat_model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        };
        let response = self
            .post(self.completions_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM backend request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("LLM backend returned {}: {}", status, body));
        }
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {}", e))?;

        let message = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .ok_or_else(|| anyhow::anyhow!("LLM response contained no message"))?;

        Ok(ChatCompletion {
            content: message.content,
            role: message.role,
            usage: completion.usage.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard) -> LlmClient {
        LlmClient::new(
            server.url(),
            Some("test-key".to_string()),
            "text-embedding-3-small",
            "gpt-4o-mini",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_embeddings_restore_input_order() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/embeddings")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#,
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let vectors = client
            .embed_texts(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();

        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_embedding_count_mismatch_is_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(200)
            .with_body(r#"{"data":[{"index":0,"embedding":[1.0]}]}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client
            .embed_texts(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 vectors for 2 inputs"));
    }

    #[tokio::test]
    async fn test_provider_error_status_propagates() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.embed_texts(&["a".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn test_chat_completion_reads_content_and_usage() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"At noon."}}],
                    "usage":{"prompt_tokens":120,"completion_tokens":8,"total_tokens":128}}"#,
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let completion = client
            .complete(&CompletionRequest {
                messages: vec![PromptMessage::user("when?")],
                temperature: 0.3,
                max_tokens: 100,
            })
            .await
            .unwrap();

        assert_eq!(completion.content, "At noon.");
        assert_eq!(completion.role, "assistant");
        assert_eq!(completion.usage.total_tokens, 128);
        assert_eq!(completion.usage.prompt_tokens, 120);
    }
}
