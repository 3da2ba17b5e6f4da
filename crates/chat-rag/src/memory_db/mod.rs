//! Chat database module - SQLite-backed message store and embedding bookkeeping
pub mod embedding_store;
pub mod message_store;
pub mod migration;
pub mod schema;

pub use embedding_store::EmbeddingRecordStore;
pub use message_store::MessageStore;
pub use migration::MigrationManager;
pub use schema::*;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub type SqlitePool = Arc<Pool<SqliteConnectionManager>>;

/// Messages and their derived embedding records, sharing one connection pool
pub struct ChatDatabase {
    pub messages: MessageStore,
    pub embeddings: EmbeddingRecordStore,
    pool: SqlitePool,
}

impl ChatDatabase {
    /// Open (or create) the database file and apply pending migrations
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening chat database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }
        info!("Chat database initialized successfully");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// Private in-memory database. Every SQLite memory connection is its own
    /// database, so the pool is capped at a single connection.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            messages: MessageStore::new(Arc::clone(&pool)),
            embeddings: EmbeddingRecordStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    /// Shared pool, used by the SQLite vector index
    pub fn pool(&self) -> SqlitePool {
        Arc::clone(&self.pool)
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_message;

    #[test]
    fn test_file_database_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("chat.db");

        {
            let db = ChatDatabase::new(&path).unwrap();
            db.messages.insert_message(&sample_message("m1", "general", "alice", "hello")).unwrap();
        }

        let db = ChatDatabase::new(&path).unwrap();
        assert!(db.messages.get_message("m1").unwrap().is_some());
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.total_messages, 1);
    }
}
