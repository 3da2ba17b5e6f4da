//! SQLite-persisted vector index with an HNSW accelerator.
//!
//! Vectors live in `vector_entries` (bincode blobs) and are mirrored in an
//! in-memory cache keyed by the table's integer row id. Filtered or small
//! queries scan the cache exactly; unfiltered queries over large
//! collections go through an HNSW graph that is rebuilt lazily after writes.
//! Every write bumps a generation counter; a graph is only used while its
//! generation is current, and rebuilds run one at a time on the blocking pool.

use async_trait::async_trait;
use chrono::Utc;
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    check_dimension, cosine_similarity, sort_matches, IndexDescription, MetadataFilter, VectorEntry,
    VectorIndex, VectorMatch, VectorMetadata,
};
use crate::error::IndexConfigError;

/// Below this many entries an exact scan is cheaper than maintaining the graph.
const HNSW_MIN_ENTRIES: usize = 2048;
/// Candidates fetched from the graph per requested result before exact rescoring.
const HNSW_OVERSAMPLE: usize = 4;

struct CachedEntry {
    id: String,
    vector: Vec<f32>,
    metadata: VectorMetadata,
}

#[derive(Default)]
struct VectorCache {
    by_row: HashMap<i64, CachedEntry>,
    row_of: HashMap<String, i64>,
}

impl VectorCache {
    fn insert(&mut self, row_id: i64, entry: CachedEntry) {
        self.row_of.insert(entry.id.clone(), row_id);
        self.by_row.insert(row_id, entry);
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.row_of.remove(id) {
            Some(row_id) => self.by_row.remove(&row_id).is_some(),
            None => false,
        }
    }
}

struct AnnGraph {
    index: HNSWIndex<f32, i64>,
    /// Cache generation the graph was built from
    generation: u64,
}

pub struct SqliteVectorIndex {
    pool: Arc<Pool<SqliteConnectionManager>>,
    cache: RwLock<VectorCache>,
    /// Bumped while holding the cache write lock
    generation: AtomicU64,
    ann: RwLock<Option<Arc<AnnGraph>>>,
    rebuild: Mutex<()>,
    ann_builds: AtomicUsize,
}

impl SqliteVectorIndex {
    /// Open the index stored in the pool's database and load it into memory.
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> anyhow::Result<Self> {
        let index = Self {
            pool,
            cache: RwLock::new(VectorCache::default()),
            generation: AtomicU64::new(0),
            ann: RwLock::new(None),
            rebuild: Mutex::new(()),
            ann_builds: AtomicUsize::new(0),
        };
        index.load_cache()?;
        Ok(index)
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    fn load_cache(&self) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT row_id, id, vector, metadata FROM vector_entries")?;
        let mut rows = stmt.query([])?;

        let mut cache = VectorCache::default();
        while let Some(row) = rows.next()? {
            let row_id: i64 = row.get(0)?;
            let id: String = row.get(1)?;
            let vector_bytes: Vec<u8> = row.get(2)?;
            let metadata_json: String = row.get(3)?;
            let vector: Vec<f32> = bincode::deserialize(&vector_bytes)
                .map_err(|e| anyhow::anyhow!("Deserialization error for {}: {}", id, e))?;
            let metadata: VectorMetadata = serde_json::from_str(&metadata_json)?;
            cache.insert(row_id, CachedEntry { id, vector, metadata });
        }

        info!("Vector index loaded with {} entries", cache.by_row.len());
        let mut guard = self.write_cache()?;
        *guard = cache;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_cache(&self) -> anyhow::Result<std::sync::RwLockReadGuard<'_, VectorCache>> {
        self.cache.read().map_err(|_| anyhow::anyhow!("Vector cache lock poisoned"))
    }

    fn write_cache(&self) -> anyhow::Result<std::sync::RwLockWriteGuard<'_, VectorCache>> {
        self.cache.write().map_err(|_| anyhow::anyhow!("Vector cache lock poisoned"))
    }

    fn stored_dimension(&self) -> anyhow::Result<Option<usize>> {
        let conn = self.get_conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM vector_index_meta WHERE key = 'dimension'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(v) => Ok(Some(v.parse().map_err(|e| {
                anyhow::anyhow!("Corrupt vector index dimension '{}': {}", v, e)
            })?)),
            None => Ok(None),
        }
    }

    /// The graph, if it was built from the current cache contents.
    fn current_graph(&self) -> anyhow::Result<Option<Arc<AnnGraph>>> {
        let generation = self.generation.load(Ordering::SeqCst);
        let guard = self.ann.read().map_err(|_| anyhow::anyhow!("ANN index lock poisoned"))?;
        Ok(guard.as_ref().filter(|g| g.generation == generation).cloned())
    }

    async fn fresh_graph(&self, dimension: usize) -> anyhow::Result<Arc<AnnGraph>> {
        if let Some(graph) = self.current_graph()? {
            return Ok(graph);
        }
        let _rebuild = self.rebuild.lock().await;
        // Another query may have rebuilt while this one waited.
        if let Some(graph) = self.current_graph()? {
            return Ok(graph);
        }

        let (generation, points) = {
            let cache = self.read_cache()?;
            let points: Vec<(i64, Vec<f32>)> = cache
                .by_row
                .iter()
                .map(|(row_id, entry)| (*row_id, entry.vector.clone()))
                .collect();
            (self.generation.load(Ordering::SeqCst), points)
        };
        let count = points.len();

        let index = tokio::task::spawn_blocking(move || build_hnsw(dimension, &points))
            .await
            .map_err(|e| anyhow::anyhow!("HNSW build task failed: {}", e))??;
        let builds = self.ann_builds.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("HNSW graph #{} built over {} vectors (generation {})", builds, count, generation);

        let graph = Arc::new(AnnGraph { index, generation });
        *self.ann.write().map_err(|_| anyhow::anyhow!("ANN index lock poisoned"))? = Some(Arc::clone(&graph));
        Ok(graph)
    }

    async fn query_ann(&self, vector: &[f32], top_k: usize) -> anyhow::Result<Vec<VectorMatch>> {
        let graph = self.fresh_graph(vector.len()).await?;
        let candidates = graph.index.search(vector, top_k * HNSW_OVERSAMPLE);

        let cache = self.read_cache()?;
        let mut matches: Vec<VectorMatch> = candidates
            .iter()
            .filter_map(|row_id| cache.by_row.get(row_id))
            .map(|entry| VectorMatch {
                id: entry.id.clone(),
                score: cosine_similarity(vector, &entry.vector),
                metadata: entry.metadata.clone(),
            })
            .collect();
        sort_matches(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }

    fn query_exact(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> anyhow::Result<Vec<VectorMatch>> {
        let cache = self.read_cache()?;
        let mut matches: Vec<VectorMatch> = cache
            .by_row
            .values()
            .filter(|entry| filter.map_or(true, |f| f.matches(&entry.metadata)))
            .map(|entry| VectorMatch {
                id: entry.id.clone(),
                score: cosine_similarity(vector, &entry.vector),
                metadata: entry.metadata.clone(),
            })
            .collect();
        sort_matches(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }
}

fn build_hnsw(dimension: usize, points: &[(i64, Vec<f32>)]) -> anyhow::Result<HNSWIndex<f32, i64>> {
    let params = HNSWParams {
        n_neighbor: 16,
        ef_build: 100,
        ef_search: 64,
        ..Default::default()
    };
    let mut index = HNSWIndex::<f32, i64>::new(dimension, &params);
    for (row_id, vector) in points {
        index
            .add(vector, *row_id)
            .map_err(|e| anyhow::anyhow!("Failed to add vector at row {}: {}", row_id, e))?;
    }
    index
        .build(Metric::CosineSimilarity)
        .map_err(|e| anyhow::anyhow!("Failed to build index: {}", e))?;
    Ok(index)
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, entries: &[VectorEntry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        check_dimension(self.stored_dimension()?, entries)?;

        let mut written = Vec::with_capacity(entries.len());
        {
            let mut conn = self.get_conn()?;
            let tx = conn.transaction()?;
            let now = Utc::now().to_rfc3339();
            for entry in entries {
                let vector_bytes = bincode::serialize(&entry.vector)?;
                let metadata_json = serde_json::to_string(&entry.metadata)?;
                let row_id: i64 = tx.query_row(
                    "INSERT INTO vector_entries (id, vector, metadata, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        vector = excluded.vector, metadata = excluded.metadata, updated_at = excluded.updated_at
                     RETURNING row_id",
                    params![entry.id, vector_bytes, metadata_json, now],
                    |row| row.get(0),
                )?;
                written.push(row_id);
            }
            tx.commit()?;
        }

        let mut cache = self.write_cache()?;
        for (row_id, entry) in written.into_iter().zip(entries) {
            cache.insert(
                row_id,
                CachedEntry {
                    id: entry.id.clone(),
                    vector: entry.vector.clone(),
                    metadata: entry.metadata.clone(),
                },
            );
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        debug!("Upserted {} vectors ({} total)", entries.len(), cache.by_row.len());
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> anyhow::Result<Vec<VectorMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let unfiltered = filter.map_or(true, |f| f.is_empty());
        let size = self.read_cache()?.by_row.len();

        if unfiltered && size >= HNSW_MIN_ENTRIES {
            match self.query_ann(vector, top_k).await {
                Ok(matches) => return Ok(matches),
                Err(e) => warn!("ANN search failed, falling back to exact scan: {}", e),
            }
        }
        self.query_exact(vector, top_k, filter)
    }

    async fn delete_many(&self, ids: &[String]) -> anyhow::Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        {
            let mut conn = self.get_conn()?;
            let tx = conn.transaction()?;
            for id in ids {
                tx.execute("DELETE FROM vector_entries WHERE id = ?1", [id])?;
            }
            tx.commit()?;
        }

        let mut cache = self.write_cache()?;
        let removed = ids.iter().filter(|id| cache.remove(id)).count();
        if removed > 0 {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn describe(&self) -> anyhow::Result<IndexDescription> {
        let dimension = self.stored_dimension()?;
        Ok(IndexDescription {
            dimension,
            ready: dimension.is_some(),
            count: self.read_cache()?.by_row.len(),
        })
    }

    async fn create(&self, dimension: usize) -> anyhow::Result<()> {
        if dimension == 0 {
            return Err(IndexConfigError::InvalidDimension(dimension).into());
        }
        if let Some(existing) = self.stored_dimension()? {
            if existing != dimension {
                return Err(IndexConfigError::DimensionMismatch { configured: dimension, index: existing }.into());
            }
            return Ok(());
        }
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO vector_index_meta (key, value) VALUES ('dimension', ?1)",
            [dimension.to_string()],
        )?;
        info!("Vector index created with dimension {}", dimension);
        Ok(())
    }
}
