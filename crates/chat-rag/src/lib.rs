// chat-rag/crates/chat-rag/src/lib.rs

pub mod api;
pub mod config;
pub mod context_engine;
pub mod error;
pub mod indexing;
pub mod llm;
pub mod memory_db;
pub mod metrics;
pub mod safety;
pub mod server;
pub mod shared_state;
pub mod telemetry;
pub mod utils;
pub mod vector_index;

#[cfg(test)]
pub(crate) mod test_support;

// Public API exports
pub use config::Config;
pub use server::{build_router, run_server};
pub use error::{IndexConfigError, SafetyError};

pub use context_engine::{
    AssembledContext, Citation, ContextAssembler, MessageContext, ProcessedResponse,
    PromptBuilder, RagPipeline, ResponseMetadata, ResponseValidator, SearchResult,
    SemanticRetriever,
};
pub use indexing::{BackfillStats, EmbeddingBackfillJob, MessageIndexer};
pub use llm::{AnswerGenerator, EmbeddingProvider, LlmClient, RetryPolicy};
pub use memory_db::{ChatDatabase, EmbeddingStatus, StoredMessage};
pub use safety::{SafetyConfig, SafetyGate};
pub use shared_state::AppState;
pub use utils::TextNormalizer;
pub use vector_index::{InMemoryVectorIndex, SqliteVectorIndex, VectorIndex};
