//! Embedding generation with normalization, chunked batching and retry

use std::sync::Arc;
use tracing::{debug, info};

use super::{EmbeddingModel, RetryPolicy};
use crate::utils::TextNormalizer;

#[derive(Debug, Clone)]
pub struct EmbeddingProviderConfig {
    /// Inputs per provider request
    pub batch_size: usize,
    /// Expected vector length
    pub dimension: usize,
}

impl Default for EmbeddingProviderConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            dimension: 1536,
        }
    }
}

/// Progress callback for batch embedding: `(completed, total)`.
pub type ProgressFn<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

pub struct EmbeddingProvider {
    model: Arc<dyn EmbeddingModel>,
    retry: RetryPolicy,
    config: EmbeddingProviderConfig,
}

impl EmbeddingProvider {
    pub fn new(model: Arc<dyn EmbeddingModel>, retry: RetryPolicy, config: EmbeddingProviderConfig) -> Self {
        Self {
            model,
            retry,
            config: EmbeddingProviderConfig {
                batch_size: config.batch_size.max(1),
                ..config
            },
        }
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Text as it is sent to the model, or `None` when normalization
    /// leaves nothing to embed (emoji or punctuation only).
    pub fn prepare(text: &str) -> Option<String> {
        let normalized = TextNormalizer::normalize(text);
        (!normalized.is_empty()).then_some(normalized)
    }

    /// Embed one text.
    pub async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let prepared = Self::prepare(text)
            .ok_or_else(|| anyhow::anyhow!("Nothing to embed after normalization"))?;
        self.embed_prepared(prepared).await
    }

    /// Embed text already returned by [`Self::prepare`].
    pub async fn embed_prepared(&self, prepared: String) -> anyhow::Result<Vec<f32>> {
        let mut vectors = self.embed_chunk(vec![prepared]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Embedding provider returned no vector"))
    }

    /// Embed many texts, one vector per input in input order.
    ///
    /// Inputs are sent in chunks of `batch_size`; `on_progress` is told how
    /// many inputs are done after each chunk. A chunk that still fails after
    /// its retries fails the whole call. An input with nothing left after
    /// normalization is rejected before any request is made; callers filter
    /// those out with [`Self::prepare`].
    pub async fn embed_batch(
        &self,
        texts: &[String],
        on_progress: Option<ProgressFn<'_>>,
    ) -> anyhow::Result<Vec<Vec<f32>>> {
        let prepared = texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Self::prepare(t).ok_or_else(|| anyhow::anyhow!("Input {} is empty after normalization", i))
            })
            .collect::<anyhow::Result<Vec<String>>>()?;
        self.embed_prepared_batch(prepared, on_progress).await
    }

    /// [`Self::embed_batch`] for texts already returned by [`Self::prepare`].
    pub async fn embed_prepared_batch(
        &self,
        prepared: Vec<String>,
        on_progress: Option<ProgressFn<'_>>,
    ) -> anyhow::Result<Vec<Vec<f32>>> {
        let total = prepared.len();
        let mut vectors = Vec::with_capacity(total);

        for (chunk_idx, chunk) in prepared.chunks(self.config.batch_size).enumerate() {
            let chunk_vectors = self.embed_chunk(chunk.to_vec()).await.map_err(|e| {
                e.context(format!(
                    "Embedding chunk {} ({} of {} inputs done) failed",
                    chunk_idx, vectors.len(), total
                ))
            })?;
            vectors.extend(chunk_vectors);

            debug!("Embedded {}/{} inputs", vectors.len(), total);
            if let Some(report) = on_progress {
                report(vectors.len(), total);
            }
        }

        if total > self.config.batch_size {
            info!("Embedded {} inputs in {} chunks", total, (total + self.config.batch_size - 1) / self.config.batch_size);
        }
        Ok(vectors)
    }

    async fn embed_chunk(&self, inputs: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        let expected = inputs.len();
        let dimension = self.config.dimension;
        let model = &self.model;
        let inputs = &inputs;

        self.retry
            .run("embedding request", || async move {
                let vectors = model.embed_texts(inputs).await?;
                if vectors.len() != expected {
                    return Err(anyhow::anyhow!(
                        "Expected {} embeddings, provider returned {}",
                        expected,
                        vectors.len()
                    ));
                }
                if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
                    return Err(anyhow::anyhow!(
                        "Embedding dimension {} does not match configured {}",
                        bad.len(),
                        dimension
                    ));
                }
                Ok(vectors)
            })
            .await
    }
}
