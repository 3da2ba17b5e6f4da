//! Embedding status records and backfill checkpoints
use crate::memory_db::schema::*;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Result, Row};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct EmbeddingRecordStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl EmbeddingRecordStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// First phase of an index write: the record exists before the vector does.
    pub fn mark_pending(&self, message_id: &str, metadata: &VectorMetadata) -> anyhow::Result<()> {
        let metadata_json = serde_json::to_string(metadata)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO message_embeddings (message_id, embedding, status, error, metadata, updated_at)
             VALUES (?1, NULL, 'pending', NULL, ?2, ?3)
             ON CONFLICT(message_id) DO UPDATE SET
                status = 'pending', error = NULL, metadata = excluded.metadata, updated_at = excluded.updated_at",
            params![message_id, metadata_json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn mark_completed(
        &self,
        message_id: &str,
        embedding: &[f32],
        metadata: &VectorMetadata,
    ) -> anyhow::Result<()> {
        let embedding_bytes = bincode::serialize(embedding)?;
        let metadata_json = serde_json::to_string(metadata)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO message_embeddings (message_id, embedding, status, error, metadata, updated_at)
             VALUES (?1, ?2, 'completed', NULL, ?3, ?4)
             ON CONFLICT(message_id) DO UPDATE SET
                embedding = excluded.embedding, status = 'completed', error = NULL,
                metadata = excluded.metadata, updated_at = excluded.updated_at",
            params![message_id, embedding_bytes, metadata_json, Utc::now().to_rfc3339()],
        )?;
        debug!("Embedding record completed for message {}", message_id);
        Ok(())
    }

    pub fn mark_failed(&self, message_id: &str, error: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO message_embeddings (message_id, embedding, status, error, metadata, updated_at)
             VALUES (?1, NULL, 'failed', ?2, NULL, ?3)
             ON CONFLICT(message_id) DO UPDATE SET
                status = 'failed', error = excluded.error, updated_at = excluded.updated_at",
            params![message_id, error, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_record(&self, message_id: &str) -> anyhow::Result<Option<EmbeddingRecord>> {
        let conn = self.get_conn()?;
        let record = conn
            .query_row(
                "SELECT message_id, embedding, status, error, metadata, updated_at
                 FROM message_embeddings WHERE message_id = ?1",
                [message_id],
                |row| self.row_to_record(row),
            )
            .optional()?;
        Ok(record)
    }

    /// True when the message already has a completed embedding.
    pub fn is_indexed(&self, message_id: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM message_embeddings WHERE message_id = ?1 AND status = 'completed'",
                [message_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The subset of `message_ids` whose record is completed.
    pub fn completed_ids(&self, message_ids: &[String]) -> anyhow::Result<HashSet<String>> {
        if message_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; message_ids.len()].join(", ");
        let sql = format!(
            "SELECT message_id FROM message_embeddings
             WHERE status = 'completed' AND message_id IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(rusqlite::params_from_iter(message_ids.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>>>()?;
        Ok(ids)
    }

    /// Records left in `pending` by an interrupted write, oldest first.
    pub fn pending_ids(&self, limit: usize) -> anyhow::Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT message_id FROM message_embeddings WHERE status = 'pending'
             ORDER BY updated_at ASC LIMIT ?1",
        )?;
        let ids = stmt
            .query_map([limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn delete_record(&self, message_id: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM message_embeddings WHERE message_id = ?1", [message_id])?;
        Ok(())
    }

    pub fn get_stats(&self) -> anyhow::Result<EmbeddingStats> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM message_embeddings GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut stats = EmbeddingStats::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            match EmbeddingStatus::parse(&status) {
                Some(EmbeddingStatus::Pending) => stats.pending = count,
                Some(EmbeddingStatus::Completed) => stats.completed = count,
                Some(EmbeddingStatus::Failed) => stats.failed = count,
                None => {}
            }
        }
        Ok(stats)
    }

    pub fn load_checkpoint(&self, job: &str) -> anyhow::Result<Option<String>> {
        let conn = self.get_conn()?;
        let cursor = conn
            .query_row(
                "SELECT last_message_id FROM backfill_checkpoints WHERE job = ?1",
                [job],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor)
    }

    /// Persist the cursor; it never moves backwards.
    pub fn save_checkpoint(&self, job: &str, last_message_id: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO backfill_checkpoints (job, last_message_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(job) DO UPDATE SET
                last_message_id = MAX(last_message_id, excluded.last_message_id),
                updated_at = excluded.updated_at",
            params![job, last_message_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn row_to_record(&self, row: &Row) -> Result<EmbeddingRecord> {
        let embedding_bytes: Option<Vec<u8>> = row.get(1)?;
        let embedding = match embedding_bytes {
            Some(bytes) => Some(
                bincode::deserialize::<Vec<f32>>(&bytes)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Blob, Box::new(e)))?,
            ),
            None => None,
        };

        let status_str: String = row.get(2)?;
        let status = EmbeddingStatus::parse(&status_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown embedding status '{}'", status_str).into(),
            )
        })?;

        let metadata_json: Option<String> = row.get(4)?;
        let metadata = match metadata_json {
            Some(json) => Some(
                serde_json::from_str(&json)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e)))?,
            ),
            None => None,
        };

        let updated_at_str: String = row.get(5)?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e)))?
            .with_timezone(&Utc);

        Ok(EmbeddingRecord {
            message_id: row.get(0)?,
            embedding,
            status,
            error: row.get(3)?,
            metadata,
            updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::ChatDatabase;
    use crate::test_support::sample_message;

    #[test]
    fn test_status_transitions_keep_one_row() {
        let db = ChatDatabase::new_in_memory().unwrap();
        let metadata = sample_message("m1", "general", "alice", "hello").to_metadata();

        db.embeddings.mark_pending("m1", &metadata).unwrap();
        assert!(!db.embeddings.is_indexed("m1").unwrap());
        assert_eq!(db.embeddings.pending_ids(10).unwrap(), vec!["m1".to_string()]);

        db.embeddings.mark_completed("m1", &[0.5, 0.5], &metadata).unwrap();
        let record = db.embeddings.get_record("m1").unwrap().unwrap();
        assert_eq!(record.status, EmbeddingStatus::Completed);
        assert_eq!(record.embedding, Some(vec![0.5, 0.5]));
        assert_eq!(record.metadata.unwrap().channel_id, metadata.channel_id);
        assert!(db.embeddings.is_indexed("m1").unwrap());

        db.embeddings.mark_failed("m1", "provider down").unwrap();
        let record = db.embeddings.get_record("m1").unwrap().unwrap();
        assert_eq!(record.status, EmbeddingStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("provider down"));

        let stats = db.embeddings.get_stats().unwrap();
        assert_eq!(stats, EmbeddingStats { pending: 0, completed: 0, failed: 1 });
    }

    #[test]
    fn test_completed_ids_filters_by_status() {
        let db = ChatDatabase::new_in_memory().unwrap();
        let metadata = sample_message("m1", "general", "alice", "hello").to_metadata();
        db.embeddings.mark_completed("m1", &[1.0], &metadata).unwrap();
        db.embeddings.mark_pending("m2", &metadata).unwrap();
        db.embeddings.mark_failed("m3", "boom").unwrap();

        let ids = vec!["m1".to_string(), "m2".to_string(), "m3".to_string(), "m4".to_string()];
        let done = db.embeddings.completed_ids(&ids).unwrap();
        assert_eq!(done.len(), 1);
        assert!(done.contains("m1"));
    }

    #[test]
    fn test_checkpoint_is_monotonic() {
        let db = ChatDatabase::new_in_memory().unwrap();
        assert_eq!(db.embeddings.load_checkpoint("backfill").unwrap(), None);

        db.embeddings.save_checkpoint("backfill", "m5").unwrap();
        db.embeddings.save_checkpoint("backfill", "m3").unwrap();
        assert_eq!(db.embeddings.load_checkpoint("backfill").unwrap().as_deref(), Some("m5"));

        db.embeddings.save_checkpoint("backfill", "m7").unwrap();
        assert_eq!(db.embeddings.load_checkpoint("backfill").unwrap().as_deref(), Some("m7"));
    }
}
