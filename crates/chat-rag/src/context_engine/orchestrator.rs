//! End-to-end answer pipeline: retrieve, assemble, prompt, generate, validate.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::context_assembler::ContextAssembler;
use super::prompt_builder::PromptBuilder;
use super::response_validator::{ProcessedResponse, ResponseMetadata, ResponseValidator};
use super::retriever::{SemanticRetriever, DEFAULT_SEARCH_LIMIT};
use crate::error::SafetyError;
use crate::llm::{AnswerGenerator, TokenUsage};
use crate::metrics;
use crate::safety::{MeteredResponse, SafetyGate};
use crate::utils::estimate_tokens;

/// Returned when retrieval finds nothing worth citing.
pub const NO_CONTEXT_ANSWER: &str =
    "I couldn't find any messages related to your question. Try rephrasing it or asking about a different topic.";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Candidates fetched from the index before packing
    pub search_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

pub struct RagPipeline {
    retriever: Arc<SemanticRetriever>,
    assembler: ContextAssembler,
    generator: AnswerGenerator,
    gate: Arc<SafetyGate>,
    config: PipelineConfig,
}

impl RagPipeline {
    pub fn new(
        retriever: Arc<SemanticRetriever>,
        assembler: ContextAssembler,
        generator: AnswerGenerator,
        gate: Arc<SafetyGate>,
        config: PipelineConfig,
    ) -> Self {
        info!(
            "RAG pipeline ready (search limit {}, context budget {} tokens)",
            config.search_limit,
            assembler.config().max_tokens
        );
        Self {
            retriever,
            assembler,
            generator,
            gate,
            config,
        }
    }

    pub fn gate(&self) -> &Arc<SafetyGate> {
        &self.gate
    }

    pub fn retriever(&self) -> &Arc<SemanticRetriever> {
        &self.retriever
    }

    /// Upper bound on the tokens one answer can consume, checked before
    /// any model call.
    pub fn estimate_request_tokens(&self, query: &str) -> u64 {
        (estimate_tokens(query) + self.assembler.config().max_tokens) as u64
            + self.generator.config().max_tokens as u64
    }

    /// Answer `query` for `user_id` under the safety gate.
    pub async fn answer(
        &self,
        user_id: &str,
        query: &str,
        channel_id: Option<&str>,
    ) -> Result<ProcessedResponse, SafetyError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(anyhow::anyhow!("Query must not be empty").into());
        }

        let estimate = self.estimate_request_tokens(query);
        self.gate
            .guard(user_id, estimate, self.run(query, channel_id))
            .await
    }

    /// The ungated pipeline. Returns the provider usage alongside the
    /// response so the gate can charge it.
    pub async fn run(&self, query: &str, channel_id: Option<&str>) -> anyhow::Result<MeteredResponse> {
        let start = Instant::now();

        let results = self
            .retriever
            .search(query, channel_id, self.config.search_limit)
            .await?;
        let context = self.assembler.assemble(&results);

        if context.is_empty() {
            debug!("No context for query, skipping generation");
            return Ok(MeteredResponse {
                response: no_context_response(start),
                usage: TokenUsage::default(),
            });
        }

        let system_prompt = PromptBuilder::build_system_prompt(&context.render());
        let answer = self.generator.generate(&system_prompt, query).await?;

        let usage = answer.usage();
        let response = ResponseValidator::process(&answer.content, &context.messages, usage, start);
        metrics::observe_answer_latency(start.elapsed().as_secs_f64());
        info!(
            "Answered with {} context messages, {} citations (valid: {})",
            context.messages.len(),
            response.citations.len(),
            response.is_valid
        );

        Ok(MeteredResponse { response, usage })
    }
}

fn no_context_response(start: Instant) -> ProcessedResponse {
    ProcessedResponse {
        content: NO_CONTEXT_ANSWER.to_string(),
        citations: Vec::new(),
        is_valid: true,
        validation_errors: Vec::new(),
        metadata: ResponseMetadata {
            processing_time_ms: start.elapsed().as_millis() as u64,
            ..ResponseMetadata::default()
        },
    }
}
