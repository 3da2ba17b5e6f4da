//! Shared application state handed to every API handler
//!
//! Components are built once at startup and shared through `Arc`s; the
//! state itself is cheap to clone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::{
    config::Config,
    context_engine::{ContextAssembler, RagPipeline, SemanticRetriever},
    indexing::{EmbeddingBackfillJob, InMemoryIndexQueue, IndexWriter, MessageIndexer},
    llm::{AnswerGenerator, ChatModel, EmbeddingModel, EmbeddingProvider},
    memory_db::ChatDatabase,
    safety::SafetyGate,
    vector_index::VectorIndex,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<ChatDatabase>,
    pub index: Arc<dyn VectorIndex>,
    pub provider: Arc<EmbeddingProvider>,
    pub writer: IndexWriter,
    pub indexer: MessageIndexer,
    pub backfill: Arc<EmbeddingBackfillJob>,
    pub retriever: Arc<SemanticRetriever>,
    pub pipeline: Arc<RagPipeline>,
    pub gate: Arc<SafetyGate>,
    backfill_running: Arc<AtomicBool>,
}

impl AppState {
    /// Wire every component from configuration and the two model endpoints.
    pub fn new(
        config: Config,
        db: Arc<ChatDatabase>,
        index: Arc<dyn VectorIndex>,
        embedding_model: Arc<dyn EmbeddingModel>,
        chat_model: Arc<dyn ChatModel>,
    ) -> Self {
        let provider = Arc::new(EmbeddingProvider::new(
            embedding_model,
            config.retry_policy(),
            config.embedding_provider_config(),
        ));
        let writer = IndexWriter::new(Arc::clone(&db), Arc::clone(&index));

        let indexer = MessageIndexer::new(
            Arc::clone(&db),
            Arc::clone(&provider),
            writer.clone(),
            Arc::new(InMemoryIndexQueue::new()),
            config.indexer_config(),
        );
        let backfill = Arc::new(EmbeddingBackfillJob::new(
            Arc::clone(&db),
            Arc::clone(&provider),
            writer.clone(),
            config.embedding_batch_size,
        ));

        let retriever = Arc::new(SemanticRetriever::new(
            Arc::clone(&provider),
            Arc::clone(&index),
            config.similarity_threshold,
        ));
        let gate = Arc::new(SafetyGate::new(config.safety_config()));
        let pipeline = Arc::new(RagPipeline::new(
            Arc::clone(&retriever),
            ContextAssembler::new(config.assembler_config()),
            AnswerGenerator::new(chat_model, config.retry_policy(), config.generation_config()),
            Arc::clone(&gate),
            config.pipeline_config(),
        ));

        info!("Application state initialized");
        Self {
            config: Arc::new(config),
            db,
            index,
            provider,
            writer,
            indexer,
            backfill,
            retriever,
            pipeline,
            gate,
            backfill_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the backfill slot. `false` if a backfill is already running.
    pub fn try_start_backfill(&self) -> bool {
        !self.backfill_running.swap(true, Ordering::SeqCst)
    }

    pub fn finish_backfill(&self) {
        self.backfill_running.store(false, Ordering::SeqCst);
    }

    pub fn is_backfill_running(&self) -> bool {
        self.backfill_running.load(Ordering::SeqCst)
    }
}
