//! Read access to chat messages, plus the writes the ingest path and tests need
use crate::memory_db::schema::*;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Result, Row};
use std::sync::Arc;
use tracing::debug;

const SELECT_MESSAGE: &str = "
    SELECT m.id, m.content, m.channel_id, COALESCE(c.name, m.channel_id),
           m.user_id, COALESCE(u.username, m.user_id), m.created_at, m.parent_id, m.attachments
    FROM messages m
    LEFT JOIN channels c ON c.id = m.channel_id
    LEFT JOIN users u ON u.id = m.user_id";

pub struct MessageStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MessageStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn upsert_channel(&self, id: &str, name: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO channels (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![id, name],
        )?;
        Ok(())
    }

    pub fn upsert_user(&self, id: &str, username: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO users (id, username) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET username = excluded.username",
            params![id, username],
        )?;
        Ok(())
    }

    /// Insert a message, registering its channel and author names when given.
    /// Messages are immutable: inserting an existing id is a no-op.
    pub fn insert_message(&self, message: &StoredMessage) -> anyhow::Result<()> {
        if !message.channel_name.is_empty() {
            self.upsert_channel(&message.channel_id, &message.channel_name)?;
        }
        if !message.username.is_empty() {
            self.upsert_user(&message.user_id, &message.username)?;
        }
        let attachments = serde_json::to_string(&message.attachments)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO messages
             (id, content, channel_id, user_id, created_at, parent_id, attachments)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.content,
                message.channel_id,
                message.user_id,
                message.created_at.to_rfc3339(),
                message.parent_id,
                attachments,
            ],
        )?;
        debug!("Stored message {} in channel {}", message.id, message.channel_id);
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> anyhow::Result<Option<StoredMessage>> {
        let conn = self.get_conn()?;
        let sql = format!("{} WHERE m.id = ?1", SELECT_MESSAGE);
        let message = conn
            .query_row(&sql, [id], |row| self.row_to_message(row))
            .optional()?;
        Ok(message)
    }

    /// Number of messages with non-empty content and an id past `after_id`.
    pub fn count_eligible(&self, after_id: Option<&str>) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE TRIM(content) != '' AND (?1 IS NULL OR id > ?1)",
            params![after_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// One page of eligible messages ordered by id ascending.
    pub fn fetch_page(&self, after_id: Option<&str>, limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "{} WHERE TRIM(m.content) != '' AND (?1 IS NULL OR m.id > ?1) ORDER BY m.id ASC LIMIT ?2",
            SELECT_MESSAGE
        );
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(params![after_id, limit as i64], |row| self.row_to_message(row))?
            .collect::<Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Messages of one channel created at or after `since`, newest first.
    pub fn get_channel_messages(
        &self,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "{} WHERE m.channel_id = ?1 AND (?2 IS NULL OR m.created_at >= ?2)
             ORDER BY m.created_at DESC LIMIT ?3",
            SELECT_MESSAGE
        );
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(
                params![channel_id, since.map(|s| s.to_rfc3339()), limit as i64],
                |row| self.row_to_message(row),
            )?
            .collect::<Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Delete a message together with its embedding record.
    pub fn delete_message(&self, id: &str) -> anyhow::Result<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM message_embeddings WHERE message_id = ?1", [id])?;
        let deleted = tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn row_to_message(&self, row: &Row) -> Result<StoredMessage> {
        let created_at_str: String = row.get(6)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))?
            .with_timezone(&Utc);
        let attachments_json: String = row.get(8)?;
        let attachments: Vec<Attachment> = serde_json::from_str(&attachments_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e)))?;

        Ok(StoredMessage {
            id: row.get(0)?,
            content: row.get(1)?,
            channel_id: row.get(2)?,
            channel_name: row.get(3)?,
            user_id: row.get(4)?,
            username: row.get(5)?,
            created_at,
            parent_id: row.get(7)?,
            attachments,
        })
    }
}
