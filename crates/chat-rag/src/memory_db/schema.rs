//! Database schema definitions for the chat message store and embedding bookkeeping
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::vector_index::VectorMetadata;

/// A chat message as read from the message store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub content: String,
    pub channel_id: String,
    /// Denormalized channel name (falls back to the channel id)
    #[serde(default)]
    pub channel_name: String,
    pub user_id: String,
    /// Denormalized author name (falls back to the user id)
    #[serde(default)]
    pub username: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl StoredMessage {
    /// Snapshot of the fields the vector index needs for filtering and display.
    pub fn to_metadata(&self) -> VectorMetadata {
        VectorMetadata {
            channel_id: self.channel_id.clone(),
            channel_name: self.channel_name.clone(),
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            content: self.content.clone(),
            created_at: self.created_at,
            parent_id: self.parent_id.clone(),
            content_hash: blake3::hash(self.content.as_bytes()).to_hex().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Lifecycle of a message's embedding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Pending,
    Completed,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Completed => "completed",
            EmbeddingStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EmbeddingStatus::Pending),
            "completed" => Some(EmbeddingStatus::Completed),
            "failed" => Some(EmbeddingStatus::Failed),
            _ => None,
        }
    }
}

/// Derived embedding state, one row per message id
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub message_id: String,
    pub embedding: Option<Vec<f32>>,
    pub status: EmbeddingStatus,
    pub error: Option<String>,
    pub metadata: Option<VectorMetadata>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmbeddingStats {
    pub pending: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_messages: i64,
    pub total_embedding_records: i64,
    pub total_vector_entries: i64,
    pub database_size_bytes: i64,
}

pub const SCHEMA_SQL: &str = "
-- Channels (denormalized names for display)
CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL
);
-- Users (denormalized names for display)
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL
);
-- Messages table
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    parent_id TEXT,
    attachments TEXT NOT NULL DEFAULT '[]'
);
-- Embedding status per message
CREATE TABLE IF NOT EXISTS message_embeddings (
    message_id TEXT PRIMARY KEY,
    embedding BLOB,
    status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')),
    error TEXT,
    metadata TEXT,
    updated_at TIMESTAMP NOT NULL
);
-- Backfill resume cursors
CREATE TABLE IF NOT EXISTS backfill_checkpoints (
    job TEXT PRIMARY KEY,
    last_message_id TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
-- Vector index storage
CREATE TABLE IF NOT EXISTS vector_index_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS vector_entries (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    vector BLOB NOT NULL,
    metadata TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages (channel_id);
CREATE INDEX IF NOT EXISTS idx_messages_created ON messages (created_at);
CREATE INDEX IF NOT EXISTS idx_embeddings_status ON message_embeddings (status);
";
