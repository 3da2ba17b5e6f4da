//! Utilities module - text normalization and token estimation shared by the pipeline

pub mod text_utils;

// Re-export commonly used utilities
pub use text_utils::{estimate_tokens, TextNormalizer, MAX_EMBEDDING_CHARS};
