//! Indexing side of the pipeline: historical backfill and near-real-time
//! indexing of incoming messages. Both feed the vector index through
//! [`IndexWriter`], which records intent before touching the index.

pub mod backfill;
pub mod message_queue;

pub use backfill::{BackfillStats, EmbeddingBackfillJob, BACKFILL_JOB};
pub use message_queue::{InMemoryIndexQueue, IndexQueue, IndexerConfig, MessageIndexer, QueuedMessage};

use std::sync::Arc;
use tracing::{debug, warn};

use crate::memory_db::{ChatDatabase, StoredMessage};
use crate::metrics;
use crate::vector_index::{VectorEntry, VectorIndex};

/// Dual write of vector index entries and embedding records.
///
/// Sequence: record `pending`, vector upsert, record `completed`. A crash
/// between the steps leaves a `pending` record for
/// [`EmbeddingBackfillJob::reconcile_pending`] to pick up.
#[derive(Clone)]
pub struct IndexWriter {
    db: Arc<ChatDatabase>,
    index: Arc<dyn VectorIndex>,
}

impl IndexWriter {
    pub fn new(db: Arc<ChatDatabase>, index: Arc<dyn VectorIndex>) -> Self {
        Self { db, index }
    }

    pub async fn write(&self, message: &StoredMessage, vector: Vec<f32>) -> anyhow::Result<()> {
        self.write_batch(std::slice::from_ref(message), vec![vector]).await
    }

    /// Index `messages[i]` with `vectors[i]`.
    pub async fn write_batch(&self, messages: &[StoredMessage], vectors: Vec<Vec<f32>>) -> anyhow::Result<()> {
        if messages.len() != vectors.len() {
            return Err(anyhow::anyhow!(
                "{} messages but {} vectors",
                messages.len(),
                vectors.len()
            ));
        }

        let entries: Vec<VectorEntry> = messages
            .iter()
            .zip(vectors)
            .map(|(message, vector)| VectorEntry {
                id: message.id.clone(),
                vector,
                metadata: message.to_metadata(),
            })
            .collect();

        for entry in &entries {
            self.db.embeddings.mark_pending(&entry.id, &entry.metadata)?;
        }
        self.index.upsert(&entries).await?;
        for entry in &entries {
            self.db
                .embeddings
                .mark_completed(&entry.id, &entry.vector, &entry.metadata)?;
        }

        metrics::inc_embeddings("completed", entries.len() as u64);
        debug!("Indexed {} message(s)", entries.len());
        Ok(())
    }

    /// Mark the message `failed` with the error chain as its reason.
    pub fn record_failure(&self, message_id: &str, error: &anyhow::Error) -> anyhow::Result<()> {
        warn!("Indexing failed for message {}: {:#}", message_id, error);
        metrics::inc_embeddings("failed", 1);
        self.db.embeddings.mark_failed(message_id, &format!("{:#}", error))
    }

    /// Remove a deleted message from the index and drop its record.
    pub async fn remove(&self, message_id: &str) -> anyhow::Result<bool> {
        let removed = self.index.delete_many(&[message_id.to_string()]).await?;
        self.db.embeddings.delete_record(message_id)?;
        Ok(removed > 0)
    }
}
