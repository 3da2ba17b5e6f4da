//! Exact, process-local vector index

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use super::{
    check_dimension, cosine_similarity, sort_matches, IndexDescription, MetadataFilter, VectorEntry,
    VectorIndex, VectorMatch, VectorMetadata,
};

/// Linear-scan index over a `DashMap`. Contents are lost on restart.
pub struct InMemoryVectorIndex {
    entries: DashMap<String, (Vec<f32>, VectorMetadata)>,
    /// 0 until created
    dimension: AtomicUsize,
}

impl InMemoryVectorIndex {
    /// An index that still needs `create`.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            dimension: AtomicUsize::new(0),
        }
    }

    pub fn with_dimension(dimension: usize) -> Self {
        let index = Self::new();
        index.dimension.store(dimension, Ordering::SeqCst);
        index
    }

    fn dimension(&self) -> Option<usize> {
        match self.dimension.load(Ordering::SeqCst) {
            0 => None,
            d => Some(d),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Stored vector for `id`, if any.
    pub fn get_vector(&self, id: &str) -> Option<Vec<f32>> {
        self.entries.get(id).map(|e| e.value().0.clone())
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, entries: &[VectorEntry]) -> anyhow::Result<()> {
        check_dimension(self.dimension(), entries)?;
        for entry in entries {
            self.entries
                .insert(entry.id.clone(), (entry.vector.clone(), entry.metadata.clone()));
        }
        debug!("Upserted {} vectors ({} total)", entries.len(), self.entries.len());
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> anyhow::Result<Vec<VectorMatch>> {
        let mut matches: Vec<VectorMatch> = self
            .entries
            .iter()
            .filter(|e| filter.map_or(true, |f| f.matches(&e.value().1)))
            .map(|e| VectorMatch {
                id: e.key().clone(),
                score: cosine_similarity(vector, &e.value().0),
                metadata: e.value().1.clone(),
            })
            .collect();
        sort_matches(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete_many(&self, ids: &[String]) -> anyhow::Result<usize> {
        Ok(ids.iter().filter(|id| self.entries.remove(id.as_str()).is_some()).count())
    }

    async fn describe(&self) -> anyhow::Result<IndexDescription> {
        let dimension = self.dimension();
        Ok(IndexDescription {
            dimension,
            ready: dimension.is_some(),
            count: self.entries.len(),
        })
    }

    async fn create(&self, dimension: usize) -> anyhow::Result<()> {
        match self
            .dimension
            .compare_exchange(0, dimension, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(existing) if existing == dimension => Ok(()),
            Err(existing) => Err(anyhow::anyhow!(
                "Index already created with dimension {}",
                existing
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_message;

    fn entry(id: &str, channel: &str, vector: Vec<f32>) -> VectorEntry {
        VectorEntry {
            id: id.to_string(),
            vector,
            metadata: sample_message(id, channel, "alice", "text").to_metadata(),
        }
    }

    #[tokio::test]
    async fn test_query_orders_by_score_and_respects_top_k() {
        let index = InMemoryVectorIndex::with_dimension(2);
        index
            .upsert(&[
                entry("a", "general", vec![1.0, 0.0]),
                entry("b", "general", vec![0.6, 0.8]),
                entry("c", "general", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let matches = index.query(&[1.0, 0.0], 2, None).await.unwrap();
        let ids: Vec<_> = matches.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!((matches[1].score - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_channel_filter() {
        let index = InMemoryVectorIndex::with_dimension(2);
        index
            .upsert(&[entry("a", "general", vec![1.0, 0.0]), entry("b", "random", vec![1.0, 0.0])])
            .await
            .unwrap();

        let filter = MetadataFilter::channel("random-id");
        let matches = index.query(&[1.0, 0.0], 10, Some(&filter)).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "b");
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_delete_counts() {
        let index = InMemoryVectorIndex::with_dimension(2);
        index.upsert(&[entry("a", "general", vec![1.0, 0.0])]).await.unwrap();
        index.upsert(&[entry("a", "general", vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get_vector("a"), Some(vec![0.0, 1.0]));

        let removed = index
            .delete_many(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_dimension_and_uncreated_index_fail() {
        let uncreated = InMemoryVectorIndex::new();
        assert!(uncreated.upsert(&[entry("a", "general", vec![1.0])]).await.is_err());

        let index = InMemoryVectorIndex::with_dimension(2);
        assert!(index.upsert(&[entry("a", "general", vec![1.0])]).await.is_err());
        assert!(index.create(3).await.is_err());
        assert!(index.create(2).await.is_ok());
    }
}
