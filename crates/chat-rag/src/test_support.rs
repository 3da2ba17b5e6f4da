//! In-process fakes shared by the unit tests

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::llm::{ChatCompletion, ChatModel, CompletionRequest, EmbeddingModel, TokenUsage};
use crate::memory_db::StoredMessage;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// Message whose channel and user ids are `<name>-id`.
pub fn sample_message(id: &str, channel: &str, username: &str, content: &str) -> StoredMessage {
    sample_message_at(id, channel, username, content, base_time())
}

pub fn sample_message_at(
    id: &str,
    channel: &str,
    username: &str,
    content: &str,
    created_at: DateTime<Utc>,
) -> StoredMessage {
    StoredMessage {
        id: id.to_string(),
        content: content.to_string(),
        channel_id: format!("{}-id", channel),
        channel_name: channel.to_string(),
        user_id: format!("{}-id", username),
        username: username.to_string(),
        created_at,
        parent_id: None,
        attachments: Vec::new(),
    }
}

/// Deterministic embedding model: every text maps to a fixed vector derived
/// from its hash unless an explicit vector was registered for it. Empty
/// inputs are rejected the way OpenAI-compatible endpoints do.
pub struct FakeEmbeddingModel {
    overrides: HashMap<String, Vec<f32>>,
    fail_remaining: AtomicUsize,
    fail_texts: Vec<String>,
    seen: Mutex<Vec<String>>,
    sizes: Mutex<Vec<usize>>,
}

impl FakeEmbeddingModel {
    pub const DIMENSION: usize = 8;

    pub fn new() -> Self {
        Self {
            overrides: HashMap::new(),
            fail_remaining: AtomicUsize::new(0),
            fail_texts: Vec::new(),
            seen: Mutex::new(Vec::new()),
            sizes: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `n` calls.
    pub fn failing_first(self, n: usize) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every call that contains `text`.
    pub fn failing_on(mut self, text: &str) -> Self {
        self.fail_texts.push(text.to_string());
        self
    }

    pub fn with_vector(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.overrides.insert(text.to_string(), vector);
        self
    }

    pub fn vector_for(text: &str) -> Vec<f32> {
        let hash = blake3::hash(text.as_bytes());
        let bytes = hash.as_bytes();
        let raw: Vec<f32> = (0..Self::DIMENSION)
            .map(|i| bytes[i] as f32 / 255.0 + 0.01)
            .collect();
        let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        raw.into_iter().map(|x| x / norm).collect()
    }

    pub fn seen_inputs(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn request_sizes(&self) -> Vec<usize> {
        self.sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmbeddingModel for FakeEmbeddingModel {
    async fn embed_texts(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.sizes.lock().unwrap().push(texts.len());
        let should_fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(anyhow::anyhow!("simulated provider outage"));
        }
        if texts.iter().any(|t| t.is_empty()) {
            return Err(anyhow::anyhow!("'$.input' is invalid: empty string"));
        }
        if let Some(bad) = texts.iter().find(|t| self.fail_texts.contains(t)) {
            return Err(anyhow::anyhow!("provider rejected input '{}'", bad));
        }
        self.seen.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts
            .iter()
            .map(|t| self.overrides.get(t).cloned().unwrap_or_else(|| Self::vector_for(t)))
            .collect())
    }
}

/// Chat model returning a canned answer.
pub struct FakeChatModel {
    answer: String,
    usage: TokenUsage,
    fail_remaining: AtomicUsize,
    calls: AtomicUsize,
    last: Mutex<Option<CompletionRequest>>,
}

impl FakeChatModel {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
            },
            fail_remaining: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn failing_first(self, n: usize) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        };
        self
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for FakeChatModel {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<ChatCompletion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(request.clone());
        let should_fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(anyhow::anyhow!("simulated completion failure"));
        }
        Ok(ChatCompletion {
            content: self.answer.clone(),
            role: "assistant".to_string(),
            usage: self.usage,
        })
    }
}
