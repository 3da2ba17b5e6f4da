//! Batch embedding of historical messages.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::IndexWriter;
use crate::llm::EmbeddingProvider;
use crate::memory_db::{ChatDatabase, StoredMessage};

/// Checkpoint key of the message backfill.
pub const BACKFILL_JOB: &str = "message_embeddings";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillStats {
    /// Eligible messages past the starting cursor
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Already had a completed record, or nothing to embed once normalized
    pub skipped: usize,
}

pub type BackfillProgress<'a> = &'a (dyn Fn(&BackfillStats) + Send + Sync);

pub struct EmbeddingBackfillJob {
    db: Arc<ChatDatabase>,
    provider: Arc<EmbeddingProvider>,
    writer: IndexWriter,
    page_size: usize,
}

impl EmbeddingBackfillJob {
    pub fn new(
        db: Arc<ChatDatabase>,
        provider: Arc<EmbeddingProvider>,
        writer: IndexWriter,
        page_size: usize,
    ) -> Self {
        Self {
            db,
            provider,
            writer,
            page_size: page_size.max(1),
        }
    }

    /// Embed every eligible message with an id greater than `resume_from`.
    ///
    /// Pages are walked in id order. Messages that already have a completed
    /// record, or that normalize to nothing (emoji or punctuation only), are
    /// skipped; a page whose embedding call fails is recorded as
    /// failed and the walk continues. The cursor is persisted after each page,
    /// so a store error aborts the job with the current page still to redo.
    pub async fn process(
        &self,
        resume_from: Option<&str>,
        on_progress: Option<BackfillProgress<'_>>,
    ) -> anyhow::Result<BackfillStats> {
        let mut stats = BackfillStats {
            total: self.db.messages.count_eligible(resume_from)?,
            ..Default::default()
        };
        info!(
            "Starting embedding backfill: {} eligible messages after {:?}",
            stats.total, resume_from
        );

        let mut cursor = resume_from.map(str::to_string);
        loop {
            let page = self.db.messages.fetch_page(cursor.as_deref(), self.page_size)?;
            let Some(last) = page.last().map(|m| m.id.clone()) else {
                break;
            };

            let ids: Vec<String> = page.iter().map(|m| m.id.clone()).collect();
            let done = self.db.embeddings.completed_ids(&ids)?;
            stats.skipped += done.len();
            let todo = prepare_page(page.into_iter().filter(|m| !done.contains(&m.id)), &mut stats);

            if !todo.is_empty() {
                let (completed, failed) = self.embed_and_write(todo).await?;
                stats.completed += completed;
                stats.failed += failed;
            }

            self.db.embeddings.save_checkpoint(BACKFILL_JOB, &last)?;
            cursor = Some(last);

            if let Some(report) = on_progress {
                report(&stats);
            }
        }

        info!(
            "Embedding backfill finished: {} completed, {} failed, {} skipped of {}",
            stats.completed, stats.failed, stats.skipped, stats.total
        );
        Ok(stats)
    }

    /// Continue from the persisted cursor.
    pub async fn process_from_checkpoint(
        &self,
        on_progress: Option<BackfillProgress<'_>>,
    ) -> anyhow::Result<BackfillStats> {
        let cursor = self.db.embeddings.load_checkpoint(BACKFILL_JOB)?;
        self.process(cursor.as_deref(), on_progress).await
    }

    /// Retry records stuck in `pending` after an interrupted dual write.
    /// Records whose message no longer exists, or has nothing to embed, are
    /// removed.
    pub async fn reconcile_pending(&self) -> anyhow::Result<BackfillStats> {
        let mut stats = BackfillStats::default();
        let mut seen = HashSet::new();

        loop {
            let ids: Vec<String> = self
                .db
                .embeddings
                .pending_ids(self.page_size)?
                .into_iter()
                .filter(|id| seen.insert(id.clone()))
                .collect();
            if ids.is_empty() {
                break;
            }
            stats.total += ids.len();

            let mut todo = Vec::with_capacity(ids.len());
            for id in &ids {
                let prepared = self
                    .db
                    .messages
                    .get_message(id)?
                    .and_then(|m| EmbeddingProvider::prepare(&m.content).map(|text| (m, text)));
                match prepared {
                    Some(item) => todo.push(item),
                    None => {
                        warn!("Dropping pending record for missing or blank message {}", id);
                        self.writer.remove(id).await?;
                        stats.skipped += 1;
                    }
                }
            }

            if !todo.is_empty() {
                let (completed, failed) = self.embed_and_write(todo).await?;
                stats.completed += completed;
                stats.failed += failed;
            }
        }

        if stats.total > 0 {
            info!(
                "Reconciled {} pending records: {} completed, {} failed, {} removed",
                stats.total, stats.completed, stats.failed, stats.skipped
            );
        }
        Ok(stats)
    }

    /// Returns `(completed, failed)`. Only store errors while recording a
    /// failure escape as `Err`.
    async fn embed_and_write(&self, items: Vec<(StoredMessage, String)>) -> anyhow::Result<(usize, usize)> {
        let (messages, texts): (Vec<StoredMessage>, Vec<String>) = items.into_iter().unzip();

        let result = match self.provider.embed_prepared_batch(texts, None).await {
            Ok(vectors) => self.writer.write_batch(&messages, vectors).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok((messages.len(), 0)),
            Err(e) => {
                error!("Embedding batch of {} messages failed: {:#}", messages.len(), e);
                for message in &messages {
                    self.writer.record_failure(&message.id, &e)?;
                }
                Ok((0, messages.len()))
            }
        }
    }
}

/// Pair each message with its normalized text; blank ones count as skipped.
fn prepare_page(
    messages: impl Iterator<Item = StoredMessage>,
    stats: &mut BackfillStats,
) -> Vec<(StoredMessage, String)> {
    let mut todo = Vec::new();
    for message in messages {
        match EmbeddingProvider::prepare(&message.content) {
            Some(text) => todo.push((message, text)),
            None => {
                debug!("Message {} has nothing to embed, skipping", message.id);
                stats.skipped += 1;
            }
        }
    }
    todo
}
