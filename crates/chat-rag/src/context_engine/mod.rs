//! Context engine module - retrieval, packing, prompting and citation checks

pub mod citation_parser;
pub mod context_assembler;
pub mod orchestrator;
pub mod prompt_builder;
pub mod response_validator;
pub mod retriever;

pub use context_assembler::{AssembledContext, AssemblerConfig, ContextAssembler, MessageContext};
pub use orchestrator::{PipelineConfig, RagPipeline, NO_CONTEXT_ANSWER};
pub use prompt_builder::PromptBuilder;
pub use response_validator::{Citation, ProcessedResponse, ResponseMetadata, ResponseValidator};
pub use retriever::{SearchResult, SearchResultType, SemanticRetriever};
