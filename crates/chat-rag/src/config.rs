// chat-rag/crates/chat-rag/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::context_engine::{AssemblerConfig, PipelineConfig};
use crate::indexing::IndexerConfig;
use crate::llm::{EmbeddingProviderConfig, GenerationConfig, RetryPolicy};
use crate::safety::SafetyConfig;

/// Which vector store backs the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    Sqlite,
    Memory,
}

impl FromStr for VectorBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(VectorBackend::Sqlite),
            "memory" => Ok(VectorBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown vector backend '{}' (expected sqlite or memory)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub api_host: String,
    pub api_port: u16,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub chat_model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub embedding_batch_size: usize,
    pub similarity_threshold: f32,
    pub max_context_messages: usize,
    pub max_context_tokens: usize,
    pub per_message_token_cap: usize,
    pub rate_limit_per_minute: u32,
    pub daily_token_limit: u64,
    pub daily_cost_limit: f64,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
    pub request_timeout_ms: u64,
    pub provider_timeout_seconds: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub indexer_max_retries: u32,
    pub vector_backend: VectorBackend,
    pub index_poll_interval_seconds: u64,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var_or(name, default);
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Invalid value for {}: '{}'", name, raw))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let llm_api_key = env::var("LLM_API_KEY").ok().filter(|k| !k.trim().is_empty());

        let config = Self {
            database_path: var_or("DATABASE_PATH", "./data/chat-rag.db"),
            api_host: var_or("API_HOST", "127.0.0.1"),
            api_port: parse_var("API_PORT", "8000")?,
            llm_base_url: var_or("LLM_BASE_URL", "https://api.openai.com"),
            llm_api_key,
            embedding_model: var_or("EMBEDDING_MODEL", "text-embedding-3-small"),
            embedding_dimension: parse_var("EMBEDDING_DIMENSION", "1536")?,
            chat_model: var_or("CHAT_MODEL", "gpt-4o-mini"),
            temperature: parse_var("TEMPERATURE", "0.3")?,
            max_output_tokens: parse_var("MAX_OUTPUT_TOKENS", "1000")?,
            embedding_batch_size: parse_var("EMBEDDING_BATCH_SIZE", "100")?,
            similarity_threshold: parse_var("SIMILARITY_THRESHOLD", "0.2")?,
            max_context_messages: parse_var("MAX_CONTEXT_MESSAGES", "10")?,
            max_context_tokens: parse_var("MAX_CONTEXT_TOKENS", "4000")?,
            per_message_token_cap: parse_var("PER_MESSAGE_TOKEN_CAP", "500")?,
            rate_limit_per_minute: parse_var("RATE_LIMIT_PER_MINUTE", "20")?,
            daily_token_limit: parse_var("DAILY_TOKEN_LIMIT", "100000")?,
            daily_cost_limit: parse_var("DAILY_COST_LIMIT", "1.0")?,
            input_price_per_1k: parse_var("INPUT_PRICE_PER_1K", "0.00015")?,
            output_price_per_1k: parse_var("OUTPUT_PRICE_PER_1K", "0.0006")?,
            request_timeout_ms: parse_var("REQUEST_TIMEOUT_MS", "15000")?,
            provider_timeout_seconds: parse_var("PROVIDER_TIMEOUT_SECONDS", "30")?,
            retry_max_attempts: parse_var("RETRY_MAX_ATTEMPTS", "3")?,
            retry_base_delay_ms: parse_var("RETRY_BASE_DELAY_MS", "1000")?,
            retry_max_delay_ms: parse_var("RETRY_MAX_DELAY_MS", "10000")?,
            indexer_max_retries: parse_var("INDEXER_MAX_RETRIES", "3")?,
            vector_backend: parse_var("VECTOR_BACKEND", "sqlite")?,
            index_poll_interval_seconds: parse_var("INDEX_POLL_INTERVAL_SECONDS", "10")?,
        };

        if config.embedding_batch_size == 0 {
            return Err(anyhow::anyhow!("EMBEDDING_BATCH_SIZE must be at least 1"));
        }
        if !(0.0..=1.0).contains(&config.similarity_threshold) {
            return Err(anyhow::anyhow!(
                "SIMILARITY_THRESHOLD must be within [0, 1], got {}",
                config.similarity_threshold
            ));
        }
        Ok(config)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database: {}", self.database_path);
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- LLM Backend: {} (key {})", self.llm_base_url, if self.llm_api_key.is_some() { "set" } else { "unset" });
        info!("- Embedding Model: {} (dim {})", self.embedding_model, self.embedding_dimension);
        info!("- Chat Model: {} (temperature {}, max {} tokens)", self.chat_model, self.temperature, self.max_output_tokens);
        info!("- Vector Backend: {:?}", self.vector_backend);
        info!("- Similarity Threshold: {}", self.similarity_threshold);
        info!(
            "- Context Budget: {} messages, {} tokens, {} per message",
            self.max_context_messages, self.max_context_tokens, self.per_message_token_cap
        );
        info!(
            "- Limits: {} req/min, {} tokens/day, ${:.2}/day",
            self.rate_limit_per_minute, self.daily_token_limit, self.daily_cost_limit
        );
        info!("- Request Timeout: {}ms", self.request_timeout_ms);
        info!(
            "- Retry: {} attempts, {}ms base, {}ms cap",
            self.retry_max_attempts, self.retry_base_delay_ms, self.retry_max_delay_ms
        );
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn embedding_provider_config(&self) -> EmbeddingProviderConfig {
        EmbeddingProviderConfig {
            batch_size: self.embedding_batch_size,
            dimension: self.embedding_dimension,
        }
    }

    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature,
            max_tokens: self.max_output_tokens,
        }
    }

    pub fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            max_messages: self.max_context_messages,
            max_tokens: self.max_context_tokens,
            per_message_token_cap: self.per_message_token_cap,
        }
    }

    /// Fetch at least as many candidates as the context can hold.
    pub fn pipeline_config(&self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            search_limit: defaults.search_limit.max(self.max_context_messages),
        }
    }

    pub fn safety_config(&self) -> SafetyConfig {
        SafetyConfig {
            requests_per_minute: self.rate_limit_per_minute,
            daily_token_limit: self.daily_token_limit,
            daily_cost_limit: self.daily_cost_limit,
            input_price_per_1k: self.input_price_per_1k,
            output_price_per_1k: self.output_price_per_1k,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig {
            max_retries: self.indexer_max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn index_poll_interval(&self) -> Duration {
        Duration::from_secs(self.index_poll_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper function to create a test Config with default values
    fn create_test_config() -> Config {
        Config {
            database_path: "/tmp/chat-rag-test.db".to_string(),
            api_host: "127.0.0.1".to_string(),
            api_port: 8000,
            llm_base_url: "http://127.0.0.1:8081".to_string(),
            llm_api_key: None,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimension: 1536,
            chat_model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            max_output_tokens: 1000,
            embedding_batch_size: 100,
            similarity_threshold: 0.2,
            max_context_messages: 10,
            max_context_tokens: 4000,
            per_message_token_cap: 500,
            rate_limit_per_minute: 20,
            daily_token_limit: 100_000,
            daily_cost_limit: 1.0,
            input_price_per_1k: 0.00015,
            output_price_per_1k: 0.0006,
            request_timeout_ms: 15_000,
            provider_timeout_seconds: 30,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 10_000,
            indexer_max_retries: 3,
            vector_backend: VectorBackend::Sqlite,
            index_poll_interval_seconds: 10,
        }
    }

    // ===== Address Tests =====

    #[test]
    fn test_api_addr_parsing() {
        let config = create_test_config();
        let addr = config.api_addr().unwrap();
        assert_eq!(addr.port(), 8000);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn test_api_addr_rejects_bad_host() {
        let mut config = create_test_config();
        config.api_host = "not a host".to_string();
        assert!(config.api_addr().is_err());
    }

    // ===== Derived Component Config Tests =====

    #[test]
    fn test_retry_policy_from_config() {
        let policy = create_test_config().retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_safety_config_from_config() {
        let safety = create_test_config().safety_config();
        assert_eq!(safety.requests_per_minute, 20);
        assert_eq!(safety.daily_token_limit, 100_000);
        assert_eq!(safety.request_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_assembler_config_from_config() {
        let assembler = create_test_config().assembler_config();
        assert_eq!(assembler.max_messages, 10);
        assert_eq!(assembler.max_tokens, 4000);
        assert_eq!(assembler.per_message_token_cap, 500);
    }

    #[test]
    fn test_per_message_cap_within_budget() {
        let config = create_test_config();
        assert!(config.per_message_token_cap <= config.max_context_tokens);
    }

    // ===== Parsing Tests =====

    #[test]
    fn test_vector_backend_parsing() {
        assert_eq!("sqlite".parse::<VectorBackend>().unwrap(), VectorBackend::Sqlite);
        assert_eq!(" Memory ".parse::<VectorBackend>().unwrap(), VectorBackend::Memory);
        assert!("pinecone".parse::<VectorBackend>().is_err());
    }

    #[test]
    fn test_parse_var_uses_default_when_unset() {
        let value: u32 = parse_var("CHAT_RAG_TEST_UNSET_VARIABLE", "42").unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_parse_var_reports_variable_name() {
        let err = parse_var::<u16>("CHAT_RAG_TEST_UNSET_PORT", "not-a-port").unwrap_err();
        assert!(format!("{:#}", err).contains("CHAT_RAG_TEST_UNSET_PORT"));
    }
}
