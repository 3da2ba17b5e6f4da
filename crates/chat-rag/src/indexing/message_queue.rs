//! Near-real-time indexing of newly created messages.
//!
//! New messages are queued and embedded one at a time by a single
//! background task. A failed message goes back to the tail of the queue
//! with its retry counter bumped, so later messages can overtake it; after
//! `max_retries` failures it is marked failed and dropped.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::IndexWriter;
use crate::llm::EmbeddingProvider;
use crate::memory_db::{ChatDatabase, StoredMessage};
use crate::metrics;

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Failures allowed per message before it is marked failed
    pub max_retries: u32,
    /// Backoff after a failure is `base_delay * 2^attempts`
    pub base_delay: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: StoredMessage,
    /// Failed attempts so far
    pub attempts: u32,
}

/// Storage for the pending-message queue. The in-memory implementation is
/// per process; a shared store lets several instances drain one queue.
#[async_trait]
pub trait IndexQueue: Send + Sync {
    async fn push_back(&self, item: QueuedMessage) -> anyhow::Result<()>;
    async fn front(&self) -> anyhow::Result<Option<QueuedMessage>>;
    async fn pop_front(&self) -> anyhow::Result<Option<QueuedMessage>>;
    async fn contains(&self, message_id: &str) -> anyhow::Result<bool>;
    async fn len(&self) -> anyhow::Result<usize>;
}

#[derive(Default)]
pub struct InMemoryIndexQueue {
    items: Mutex<VecDeque<QueuedMessage>>,
}

impl InMemoryIndexQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, VecDeque<QueuedMessage>>> {
        self.items.lock().map_err(|_| anyhow::anyhow!("Index queue lock poisoned"))
    }
}

#[async_trait]
impl IndexQueue for InMemoryIndexQueue {
    async fn push_back(&self, item: QueuedMessage) -> anyhow::Result<()> {
        self.lock()?.push_back(item);
        Ok(())
    }

    async fn front(&self) -> anyhow::Result<Option<QueuedMessage>> {
        Ok(self.lock()?.front().cloned())
    }

    async fn pop_front(&self) -> anyhow::Result<Option<QueuedMessage>> {
        Ok(self.lock()?.pop_front())
    }

    async fn contains(&self, message_id: &str) -> anyhow::Result<bool> {
        Ok(self.lock()?.iter().any(|q| q.message.id == message_id))
    }

    async fn len(&self) -> anyhow::Result<usize> {
        Ok(self.lock()?.len())
    }
}

struct IndexerInner {
    db: Arc<ChatDatabase>,
    provider: Arc<EmbeddingProvider>,
    writer: IndexWriter,
    queue: Arc<dyn IndexQueue>,
    config: IndexerConfig,
    processing: AtomicBool,
    idle: Notify,
}

/// Owns the queue and its single processing task. Cheap to clone.
#[derive(Clone)]
pub struct MessageIndexer {
    inner: Arc<IndexerInner>,
}

impl MessageIndexer {
    pub fn new(
        db: Arc<ChatDatabase>,
        provider: Arc<EmbeddingProvider>,
        writer: IndexWriter,
        queue: Arc<dyn IndexQueue>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(IndexerInner {
                db,
                provider,
                writer,
                queue,
                config,
                processing: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Queue a message for indexing and wake the processor.
    ///
    /// Returns `false` without queueing when the message has nothing to embed
    /// once normalized, is already indexed, or is already waiting in the queue.
    pub async fn enqueue(&self, message: StoredMessage) -> anyhow::Result<bool> {
        let inner = &self.inner;
        if EmbeddingProvider::prepare(&message.content).is_none() {
            debug!("Skipping message {} with nothing to embed", message.id);
            return Ok(false);
        }
        if inner.db.embeddings.is_indexed(&message.id)? || inner.queue.contains(&message.id).await? {
            debug!("Message {} already indexed or queued", message.id);
            return Ok(false);
        }

        inner.queue.push_back(QueuedMessage { message, attempts: 0 }).await?;
        metrics::set_queue_depth(inner.queue.len().await?);

        if !inner.processing.swap(true, Ordering::SeqCst) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run().await });
        }
        Ok(true)
    }

    pub async fn queue_len(&self) -> anyhow::Result<usize> {
        self.inner.queue.len().await
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    /// Resolve once the queue is drained and the processor has stopped.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            let empty = matches!(self.inner.queue.len().await, Ok(0) | Err(_));
            if !self.is_processing() && empty {
                return;
            }
            notified.await;
        }
    }
}

impl IndexerInner {
    async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = self.drain().await {
                error!("Index queue processing stopped: {:#}", e);
            }
            self.processing.store(false, Ordering::SeqCst);
            self.idle.notify_waiters();

            // A message enqueued after the last `front()` would otherwise wait
            // for the next enqueue.
            let pending = self.queue.len().await.unwrap_or(0);
            if pending == 0 || self.processing.swap(true, Ordering::SeqCst) {
                break;
            }
        }
    }

    async fn drain(&self) -> anyhow::Result<()> {
        while let Some(item) = self.queue.front().await? {
            let outcome = self.index_one(&item.message).await;
            self.queue.pop_front().await?;

            if let Err(e) = outcome {
                let attempts = item.attempts + 1;
                if attempts >= self.config.max_retries {
                    warn!(
                        "Giving up on message {} after {} attempts",
                        item.message.id, attempts
                    );
                    self.writer.record_failure(&item.message.id, &e)?;
                } else {
                    let delay = self.backoff(attempts);
                    warn!(
                        "Indexing message {} failed (attempt {}), retrying in {:?}: {:#}",
                        item.message.id, attempts, delay, e
                    );
                    self.queue
                        .push_back(QueuedMessage { message: item.message, attempts })
                        .await?;
                    tokio::time::sleep(delay).await;
                }
            }
            metrics::set_queue_depth(self.queue.len().await?);
        }
        info!("Index queue drained");
        Ok(())
    }

    async fn index_one(&self, message: &StoredMessage) -> anyhow::Result<()> {
        let vector = self.provider.embed(&message.content).await?;
        self.writer.write(message, vector).await
    }

    fn backoff(&self, attempts: u32) -> Duration {
        self.config
            .base_delay
            .checked_mul(2u32.saturating_pow(attempts))
            .unwrap_or(Duration::MAX)
    }
}
