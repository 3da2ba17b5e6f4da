//! Similarity-search store abstraction.
//!
//! [`VectorIndex`] is the seam between the indexing side (backfill and the
//! incoming-message indexer) and the retriever. Two implementations ship:
//! an exact in-memory index for tests and small deployments, and a
//! SQLite-persisted index with an HNSW accelerator for large collections.

pub mod memory_index;
pub mod sqlite_index;

pub use memory_index::InMemoryVectorIndex;
pub use sqlite_index::SqliteVectorIndex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::IndexConfigError;

/// Denormalized message fields stored next to each vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub channel_id: String,
    pub channel_name: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// blake3 of `content`, to spot stale entries
    #[serde(default)]
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct VectorEntry {
    /// Message id
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    /// Cosine similarity clamped to [0, 1]
    pub score: f32,
    pub metadata: VectorMetadata,
}

/// Equality filter on metadata fields
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub channel_id: Option<String>,
}

impl MetadataFilter {
    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self { channel_id: Some(channel_id.into()) }
    }

    pub fn matches(&self, metadata: &VectorMetadata) -> bool {
        match &self.channel_id {
            Some(channel_id) => &metadata.channel_id == channel_id,
            None => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channel_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDescription {
    /// `None` until the index has been created
    pub dimension: Option<usize>,
    pub ready: bool,
    pub count: usize,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace entries by id.
    async fn upsert(&self, entries: &[VectorEntry]) -> anyhow::Result<()>;

    /// Best `top_k` matches by descending score.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> anyhow::Result<Vec<VectorMatch>>;

    /// Remove entries, returning how many existed.
    async fn delete_many(&self, ids: &[String]) -> anyhow::Result<usize>;

    async fn describe(&self) -> anyhow::Result<IndexDescription>;

    /// Create an empty index for vectors of `dimension`.
    async fn create(&self, dimension: usize) -> anyhow::Result<()>;
}

/// Verify or create the index, blocking until it reports ready.
///
/// A dimension mismatch is returned as an [`IndexConfigError`] inside the
/// `anyhow::Error` and must not be retried.
pub async fn ensure_index(
    index: &dyn VectorIndex,
    dimension: usize,
    poll_interval: Duration,
) -> anyhow::Result<IndexDescription> {
    if dimension == 0 {
        return Err(IndexConfigError::InvalidDimension(dimension).into());
    }

    let mut description = index.describe().await?;
    match description.dimension {
        Some(existing) if existing != dimension => {
            return Err(IndexConfigError::DimensionMismatch {
                configured: dimension,
                index: existing,
            }
            .into());
        }
        Some(_) => {}
        None => {
            info!("Creating vector index with dimension {}", dimension);
            index.create(dimension).await?;
            description = index.describe().await?;
        }
    }

    while !description.ready {
        warn!("Vector index not ready yet, polling again in {:?}", poll_interval);
        tokio::time::sleep(poll_interval).await;
        description = index.describe().await?;
    }

    info!(
        "Vector index ready: dimension {:?}, {} entries",
        description.dimension, description.count
    );
    Ok(description)
}

/// Cosine similarity mapped into [0, 1]; mismatched or zero vectors score 0.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
    }
}

/// Descending score, then id, so equal scores come back in a stable order.
pub(crate) fn sort_matches(matches: &mut [VectorMatch]) {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub(crate) fn check_dimension(expected: Option<usize>, entries: &[VectorEntry]) -> anyhow::Result<()> {
    let Some(expected) = expected else {
        return Err(anyhow::anyhow!("Vector index has not been created"));
    };
    if let Some(bad) = entries.iter().find(|e| e.vector.len() != expected) {
        return Err(anyhow::anyhow!(
            "Vector for {} has dimension {}, index expects {}",
            bad.id,
            bad.vector.len(),
            expected
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Index that reports ready only after a number of describe calls
    struct SlowIndex {
        dimension: Mutex<Option<usize>>,
        polls_until_ready: AtomicUsize,
        creates: AtomicUsize,
    }

    impl SlowIndex {
        fn new(dimension: Option<usize>, polls_until_ready: usize) -> Self {
            Self {
                dimension: Mutex::new(dimension),
                polls_until_ready: AtomicUsize::new(polls_until_ready),
                creates: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl VectorIndex for SlowIndex {
        async fn upsert(&self, _entries: &[VectorEntry]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn query(
            &self,
            _vector: &[f32],
            _top_k: usize,
            _filter: Option<&MetadataFilter>,
        ) -> anyhow::Result<Vec<VectorMatch>> {
            Ok(Vec::new())
        }

        async fn delete_many(&self, _ids: &[String]) -> anyhow::Result<usize> {
            Ok(0)
        }

        async fn describe(&self) -> anyhow::Result<IndexDescription> {
            let remaining = self
                .polls_until_ready
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .unwrap_or(0);
            let dimension = *self.dimension.lock().unwrap();
            Ok(IndexDescription {
                dimension,
                ready: dimension.is_some() && remaining == 0,
                count: 0,
            })
        }

        async fn create(&self, dimension: usize) -> anyhow::Result<()> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            *self.dimension.lock().unwrap() = Some(dimension);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_index_creates_and_waits_until_ready() {
        let index = SlowIndex::new(None, 3);

        let description = ensure_index(&index, 8, Duration::from_secs(10)).await.unwrap();

        assert!(description.ready);
        assert_eq!(description.dimension, Some(8));
        assert_eq!(index.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let index = SlowIndex::new(Some(384), 0);

        let err = ensure_index(&index, 1536, Duration::from_millis(1)).await.unwrap_err();

        assert_eq!(
            err.downcast_ref::<IndexConfigError>(),
            Some(&IndexConfigError::DimensionMismatch { configured: 1536, index: 384 })
        );
        assert_eq!(index.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_dimension_is_rejected() {
        let index = SlowIndex::new(None, 0);
        let err = ensure_index(&index, 0, Duration::from_millis(1)).await.unwrap_err();
        assert_eq!(err.downcast_ref::<IndexConfigError>(), Some(&IndexConfigError::InvalidDimension(0)));
    }

    #[test]
    fn test_cosine_similarity_is_clamped() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
