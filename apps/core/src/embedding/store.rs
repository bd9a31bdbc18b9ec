//! Persistent vector storage for the embedding cache.
//!
//! Entries are keyed by `(round_id, cache_key)` and written append-only: inserting a
//! key that already exists in a round is a no-op. A model registry records the vector
//! dimension of every model that has written to the store.

use crate::error::AppError;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::info;

/// Keys per `IN (...)` clause, below SQLite's bound-parameter limit.
const KEY_CHUNK: usize = 500;

/// Content address of an embedding: SHA-256 over the model identity and the text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(text: &str, model_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(text.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A vector as it sits in the store: raw little-endian `f32` bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub model_id: String,
    pub dimension: usize,
    pub bytes: Vec<u8>,
}

impl StoredVector {
    pub fn encode(model_id: &str, vector: &[f32]) -> Self {
        let bytes = vector.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            model_id: model_id.to_string(),
            dimension: vector.len(),
            bytes,
        }
    }

    /// Decodes the bytes, rejecting anything that does not match `expected_dimension`
    /// exactly or holds non-finite values.
    pub fn decode(&self, expected_dimension: usize) -> Result<Vec<f32>, String> {
        if self.dimension != expected_dimension {
            return Err(format!(
                "stored dimension {} differs from model dimension {}",
                self.dimension, expected_dimension
            ));
        }
        if self.bytes.len() % 4 != 0 {
            return Err(format!("{} bytes is not a whole number of f32 values", self.bytes.len()));
        }
        if self.bytes.len() / 4 != expected_dimension {
            return Err(format!(
                "payload holds {} values, expected {}",
                self.bytes.len() / 4,
                expected_dimension
            ));
        }
        let vector: Vec<f32> = self
            .bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if vector.iter().any(|v| !v.is_finite()) {
            return Err("payload contains non-finite values".to_string());
        }
        Ok(vector)
    }
}

/// Keyed read/write interface behind the embedding cache, partitioned by `round_id`.
#[async_trait]
pub trait VectorStore: Send + Sync + 'static {
    async fn registered_dimension(&self, model_id: &str) -> Result<Option<usize>, AppError>;

    async fn register_model(&self, model_id: &str, dimension: usize) -> Result<(), AppError>;

    /// Drops the registry entry and every vector written by `model_id`, in all rounds.
    async fn invalidate_model(&self, model_id: &str) -> Result<u64, AppError>;

    async fn has_key(&self, round_id: &str, key: &CacheKey) -> Result<bool, AppError>;

    async fn get_many(
        &self,
        round_id: &str,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, StoredVector>, AppError>;

    /// Inserts entries whose key is not yet present; returns how many were written.
    async fn put_many(
        &self,
        round_id: &str,
        entries: &[(CacheKey, StoredVector)],
    ) -> Result<u64, AppError>;

    /// Removes keys so the next lookup recomputes them.
    async fn invalidate(&self, round_id: &str, keys: &[CacheKey]) -> Result<u64, AppError>;

    async fn count(&self, round_id: &str) -> Result<u64, AppError>;
}

/// SQLite-backed store; survives process restarts.
#[derive(Clone)]
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub async fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Opening embedding cache at: {:?}", path);

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// A private in-memory database, mainly for tests.
    pub async fn in_memory() -> Result<Self, AppError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, AppError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embedding_models (
                model_id TEXT PRIMARY KEY,
                dimension INTEGER NOT NULL,
                registered_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS embeddings (
                round_id TEXT NOT NULL,
                cache_key TEXT NOT NULL,
                model_id TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                vector BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (round_id, cache_key)
            );
            CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_id);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn to_dimension(raw: i64) -> usize {
    usize::try_from(raw).unwrap_or(0)
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn registered_dimension(&self, model_id: &str) -> Result<Option<usize>, AppError> {
        let row = sqlx::query("SELECT dimension FROM embedding_models WHERE model_id = ?")
            .bind(model_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(to_dimension(row.try_get::<i64, _>("dimension")?))),
            None => Ok(None),
        }
    }

    async fn register_model(&self, model_id: &str, dimension: usize) -> Result<(), AppError> {
        sqlx::query(
            "INSERT OR IGNORE INTO embedding_models (model_id, dimension, registered_at) VALUES (?, ?, ?)",
        )
        .bind(model_id)
        .bind(dimension as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invalidate_model(&self, model_id: &str) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM embeddings WHERE model_id = ?")
            .bind(model_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM embedding_models WHERE model_id = ?")
            .bind(model_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn has_key(&self, round_id: &str, key: &CacheKey) -> Result<bool, AppError> {
        let row = sqlx::query("SELECT 1 FROM embeddings WHERE round_id = ? AND cache_key = ?")
            .bind(round_id)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_many(
        &self,
        round_id: &str,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, StoredVector>, AppError> {
        let mut found = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(KEY_CHUNK) {
            let sql = format!(
                "SELECT cache_key, model_id, dimension, vector FROM embeddings WHERE round_id = ? AND cache_key IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql).bind(round_id);
            for key in chunk {
                query = query.bind(key.as_str());
            }
            for row in query.fetch_all(&self.pool).await? {
                let key: String = row.try_get("cache_key")?;
                let stored = StoredVector {
                    model_id: row.try_get("model_id")?,
                    dimension: to_dimension(row.try_get::<i64, _>("dimension")?),
                    bytes: row.try_get("vector")?,
                };
                found.insert(CacheKey(key), stored);
            }
        }
        Ok(found)
    }

    async fn put_many(
        &self,
        round_id: &str,
        entries: &[(CacheKey, StoredVector)],
    ) -> Result<u64, AppError> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for (key, stored) in entries {
            inserted += sqlx::query(
                r#"
                INSERT OR IGNORE INTO embeddings (round_id, cache_key, model_id, dimension, vector, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(round_id)
            .bind(key.as_str())
            .bind(&stored.model_id)
            .bind(stored.dimension as i64)
            .bind(stored.bytes.as_slice())
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn invalidate(&self, round_id: &str, keys: &[CacheKey]) -> Result<u64, AppError> {
        let mut removed = 0;
        for chunk in keys.chunks(KEY_CHUNK) {
            let sql = format!(
                "DELETE FROM embeddings WHERE round_id = ? AND cache_key IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql).bind(round_id);
            for key in chunk {
                query = query.bind(key.as_str());
            }
            removed += query.execute(&self.pool).await?.rows_affected();
        }
        Ok(removed)
    }

    async fn count(&self, round_id: &str) -> Result<u64, AppError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM embeddings WHERE round_id = ?")
            .bind(round_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?.max(0) as u64)
    }
}

#[derive(Default)]
struct MemoryState {
    models: HashMap<String, usize>,
    rounds: HashMap<String, HashMap<CacheKey, StoredVector>>,
}

/// Process-local store with the same append-only semantics as the SQLite store.
#[derive(Default)]
pub struct InMemoryVectorStore {
    state: RwLock<MemoryState>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces an entry regardless of the append-only rule, to simulate damage.
    #[cfg(test)]
    pub(crate) async fn overwrite_raw(&self, round_id: &str, key: CacheKey, stored: StoredVector) {
        let mut state = self.state.write().await;
        state
            .rounds
            .entry(round_id.to_string())
            .or_default()
            .insert(key, stored);
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn registered_dimension(&self, model_id: &str) -> Result<Option<usize>, AppError> {
        Ok(self.state.read().await.models.get(model_id).copied())
    }

    async fn register_model(&self, model_id: &str, dimension: usize) -> Result<(), AppError> {
        self.state
            .write()
            .await
            .models
            .entry(model_id.to_string())
            .or_insert(dimension);
        Ok(())
    }

    async fn invalidate_model(&self, model_id: &str) -> Result<u64, AppError> {
        let mut state = self.state.write().await;
        state.models.remove(model_id);
        let mut removed = 0;
        for entries in state.rounds.values_mut() {
            let before = entries.len();
            entries.retain(|_, stored| stored.model_id != model_id);
            removed += (before - entries.len()) as u64;
        }
        Ok(removed)
    }

    async fn has_key(&self, round_id: &str, key: &CacheKey) -> Result<bool, AppError> {
        let state = self.state.read().await;
        Ok(state
            .rounds
            .get(round_id)
            .is_some_and(|entries| entries.contains_key(key)))
    }

    async fn get_many(
        &self,
        round_id: &str,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, StoredVector>, AppError> {
        let state = self.state.read().await;
        let Some(entries) = state.rounds.get(round_id) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| entries.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn put_many(
        &self,
        round_id: &str,
        entries: &[(CacheKey, StoredVector)],
    ) -> Result<u64, AppError> {
        let mut state = self.state.write().await;
        let partition = state.rounds.entry(round_id.to_string()).or_default();
        let mut inserted = 0;
        for (key, stored) in entries {
            if !partition.contains_key(key) {
                partition.insert(key.clone(), stored.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn invalidate(&self, round_id: &str, keys: &[CacheKey]) -> Result<u64, AppError> {
        let mut state = self.state.write().await;
        let Some(entries) = state.rounds.get_mut(round_id) else {
            return Ok(0);
        };
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count() as u64)
    }

    async fn count(&self, round_id: &str) -> Result<u64, AppError> {
        let state = self.state.read().await;
        Ok(state.rounds.get(round_id).map_or(0, |e| e.len() as u64))
    }
}
