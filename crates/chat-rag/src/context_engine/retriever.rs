//! Semantic search over indexed chat messages

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::llm::EmbeddingProvider;
use crate::vector_index::{MetadataFilter, VectorIndex, VectorMatch};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.2;
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchResultType {
    Message,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub message_id: String,
    /// Similarity in [0, 1]
    pub score: f32,
    pub content: String,
    pub user_id: String,
    pub username: String,
    pub channel_id: String,
    pub channel_name: String,
    pub created_at: DateTime<Utc>,
    pub parent_id: Option<String>,
    pub result_type: SearchResultType,
}

impl From<VectorMatch> for SearchResult {
    fn from(m: VectorMatch) -> Self {
        Self {
            message_id: m.id,
            score: m.score,
            content: m.metadata.content,
            user_id: m.metadata.user_id,
            username: m.metadata.username,
            channel_id: m.metadata.channel_id,
            channel_name: m.metadata.channel_name,
            created_at: m.metadata.created_at,
            parent_id: m.metadata.parent_id,
            result_type: SearchResultType::Message,
        }
    }
}

pub struct SemanticRetriever {
    provider: Arc<EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    threshold: f32,
    /// Query embeddings by normalized query text
    query_cache: Cache<String, Arc<Vec<f32>>>,
}

impl SemanticRetriever {
    pub fn new(provider: Arc<EmbeddingProvider>, index: Arc<dyn VectorIndex>, threshold: f32) -> Self {
        Self {
            provider,
            index,
            threshold,
            query_cache: Cache::builder()
                .max_capacity(1000)
                .time_to_live(Duration::from_secs(300))
                .build(),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Ranked matches for `query`, optionally limited to one channel.
    ///
    /// An empty result is a valid answer; embedding or index failures are
    /// returned as errors and must not be mistaken for "nothing found".
    pub async fn search(
        &self,
        query: &str,
        channel_id: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let Some(normalized) = EmbeddingProvider::prepare(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let vector = match self.query_cache.get(&normalized) {
            Some(vector) => vector,
            None => {
                let vector = Arc::new(self.provider.embed_prepared(normalized.clone()).await?);
                self.query_cache.insert(normalized.clone(), Arc::clone(&vector));
                vector
            }
        };

        let filter = channel_id.map(MetadataFilter::channel);
        let matches = self.index.query(&vector, limit, filter.as_ref()).await?;
        let found = matches.len();

        let results: Vec<SearchResult> = matches
            .into_iter()
            .filter(|m| m.score >= self.threshold)
            .map(SearchResult::from)
            .collect();

        debug!(
            "Search '{}' returned {} matches, {} above threshold {}",
            normalized,
            found,
            results.len(),
            self.threshold
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{EmbeddingProviderConfig, RetryPolicy};
    use crate::test_support::{sample_message, FakeEmbeddingModel};
    use crate::vector_index::{InMemoryVectorIndex, VectorEntry};

    /// Unit vector in the first two dimensions with cosine `score` to e1.
    fn vector_with_score(score: f32) -> Vec<f32> {
        let mut v = vec![0.0; FakeEmbeddingModel::DIMENSION];
        v[0] = score;
        v[1] = (1.0 - score * score).sqrt();
        v
    }

    fn e1() -> Vec<f32> {
        vector_with_score(1.0)
    }

    async fn retriever_with(
        model: FakeEmbeddingModel,
        entries: Vec<(&str, &str, Vec<f32>)>,
    ) -> (SemanticRetriever, Arc<FakeEmbeddingModel>) {
        let index = Arc::new(InMemoryVectorIndex::with_dimension(FakeEmbeddingModel::DIMENSION));
        let entries: Vec<VectorEntry> = entries
            .into_iter()
            .map(|(id, channel, vector)| VectorEntry {
                id: id.to_string(),
                vector,
                metadata: sample_message(id, channel, "alice", &format!("content of {}", id)).to_metadata(),
            })
            .collect();
        index.upsert(&entries).await.unwrap();

        let model = Arc::new(model);
        let provider = Arc::new(EmbeddingProvider::new(
            model.clone(),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
            EmbeddingProviderConfig { batch_size: 10, dimension: FakeEmbeddingModel::DIMENSION },
        ));
        (SemanticRetriever::new(provider, index, DEFAULT_SIMILARITY_THRESHOLD), model)
    }

    #[tokio::test]
    async fn test_threshold_excludes_weak_matches() {
        let (retriever, _) = retriever_with(
            FakeEmbeddingModel::new().with_vector("deploy", e1()),
            vec![("weak", "general", vector_with_score(0.15)), ("ok", "general", vector_with_score(0.25))],
        )
        .await;

        let results = retriever.search("deploy", None, 10).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message_id, "ok");
        assert!((results[0].score - 0.25).abs() < 1e-4);
        assert_eq!(results[0].result_type, SearchResultType::Message);
        assert_eq!(results[0].channel_name, "general");
    }

    #[tokio::test]
    async fn test_channel_scope_and_limit() {
        let (retriever, _) = retriever_with(
            FakeEmbeddingModel::new().with_vector("deploy", e1()),
            vec![
                ("a", "general", vector_with_score(0.9)),
                ("b", "random", vector_with_score(0.95)),
                ("c", "general", vector_with_score(0.8)),
            ],
        )
        .await;

        let scoped = retriever.search("deploy", Some("general-id"), 10).await.unwrap();
        let ids: Vec<_> = scoped.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let limited = retriever.search("deploy", None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].message_id, "b");
    }

    #[tokio::test]
    async fn test_no_match_is_empty_not_error() {
        let (retriever, _) = retriever_with(FakeEmbeddingModel::new(), vec![]).await;
        assert!(retriever.search("anything", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_propagates() {
        let (retriever, _) = retriever_with(FakeEmbeddingModel::new().failing_first(5), vec![]).await;
        assert!(retriever.search("anything", None, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_punctuation_only_query_is_empty_without_embedding() {
        let (retriever, model) = retriever_with(FakeEmbeddingModel::new(), vec![]).await;

        assert!(retriever.search("?? !!", None, 10).await.unwrap().is_empty());
        assert!(model.request_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_query_is_normalized_once() {
        let (retriever, model) = retriever_with(FakeEmbeddingModel::new(), vec![]).await;

        retriever.search("**deploy** at [noon](https://x.y)", None, 10).await.unwrap();

        assert_eq!(model.seen_inputs(), vec!["deploy at noon".to_string()]);
    }

    #[tokio::test]
    async fn test_query_embedding_is_cached() {
        let (retriever, model) = retriever_with(FakeEmbeddingModel::new(), vec![]).await;

        retriever.search("**deploy** time", None, 10).await.unwrap();
        retriever.search("deploy time", None, 10).await.unwrap();

        assert_eq!(model.request_sizes().len(), 1);
    }
}
