use crate::actors::messages::{
    ActorError, AppError, CacheMessage, CacheStats, EmbeddingBatch, EmbeddingFailure, FailureKind,
};
use crate::embedding::provider::{EmbeddingProvider, ItemResult};
use crate::embedding::store::{CacheKey, StoredVector, VectorStore};
use lru::LruCache;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Tuning for the cache actor.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// Texts per provider call.
    pub batch_size: usize,
    /// Vectors kept in process memory.
    pub lru_capacity: NonZeroUsize,
}

const DEFAULT_LRU_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10_000) {
    Some(size) => size,
    None => panic!("Cache size must be non-zero"),
};

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            batch_size: 256,
            lru_capacity: DEFAULT_LRU_CAPACITY,
        }
    }
}

/// A handle to the embedding cache actor.
///
/// The actor owns the store, the in-memory LRU and the provider for one round, so
/// every write to that round goes through a single task. Handles are cheap to clone.
#[derive(Debug, Clone)]
pub struct EmbeddingCacheHandle {
    sender: mpsc::Sender<CacheMessage>,
    round_id: Arc<str>,
    model_id: Arc<str>,
}

impl EmbeddingCacheHandle {
    /// Spawns the actor for `round_id` and returns a handle to it.
    pub fn spawn(
        round_id: impl Into<String>,
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        options: CacheOptions,
    ) -> Self {
        let round_id: String = round_id.into();
        let model_id: Arc<str> = Arc::from(provider.model_id());
        let (sender, receiver) = mpsc::channel(32);
        let actor = EmbeddingCacheRunner::new(receiver, round_id.clone(), store, provider, options);
        tokio::spawn(async move { actor.run().await });
        Self {
            sender,
            round_id: Arc::from(round_id),
            model_id,
        }
    }

    pub fn round_id(&self) -> &str {
        &self.round_id
    }

    /// Model identity of the provider behind this cache.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Returns one slot per text, in order, plus per-key failures.
    pub async fn get_or_compute(
        &self,
        texts: Vec<String>,
        model_id: &str,
    ) -> Result<EmbeddingBatch, AppError> {
        let (send, recv) = oneshot::channel();
        self.send(CacheMessage::GetOrCompute {
            texts,
            model_id: model_id.to_string(),
            responder: send,
        })
        .await?;
        recv.await
            .map_err(|_| AppError::Actor(ActorError::Closed("Embedding cache failed to respond".to_string())))?
    }

    pub async fn invalidate(&self, keys: Vec<CacheKey>) -> Result<u64, AppError> {
        let (send, recv) = oneshot::channel();
        self.send(CacheMessage::Invalidate {
            keys,
            responder: send,
        })
        .await?;
        recv.await
            .map_err(|_| AppError::Actor(ActorError::Closed("Embedding cache failed to respond".to_string())))?
    }

    pub async fn invalidate_model(&self) -> Result<u64, AppError> {
        let (send, recv) = oneshot::channel();
        self.send(CacheMessage::InvalidateModel { responder: send }).await?;
        recv.await
            .map_err(|_| AppError::Actor(ActorError::Closed("Embedding cache failed to respond".to_string())))?
    }

    pub async fn stats(&self) -> Result<CacheStats, AppError> {
        let (send, recv) = oneshot::channel();
        self.send(CacheMessage::Stats { responder: send }).await?;
        recv.await
            .map_err(|_| AppError::Actor(ActorError::Closed("Embedding cache failed to respond".to_string())))
    }

    async fn send(&self, msg: CacheMessage) -> Result<(), AppError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| AppError::Actor(ActorError::Closed("Embedding cache closed".to_string())))
    }
}

// --- Actor Runner (Internal Logic) ---
struct EmbeddingCacheRunner {
    receiver: mpsc::Receiver<CacheMessage>,
    round_id: String,
    store: Arc<dyn VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    memory: LruCache<CacheKey, Arc<[f32]>>,
    registered_dimension: Option<usize>,
    stats: CacheStats,
}

/// Where each distinct key of a request appears.
struct RequestIndex {
    positions: HashMap<CacheKey, Vec<usize>>,
    unique: Vec<(CacheKey, String)>,
}

impl EmbeddingCacheRunner {
    fn new(
        receiver: mpsc::Receiver<CacheMessage>,
        round_id: String,
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        options: CacheOptions,
    ) -> Self {
        Self {
            receiver,
            round_id,
            store,
            provider,
            batch_size: options.batch_size.max(1),
            memory: LruCache::new(options.lru_capacity),
            registered_dimension: None,
            stats: CacheStats::default(),
        }
    }

    async fn run(mut self) {
        info!("EmbeddingCache started for round '{}'", self.round_id);
        while let Some(msg) = self.receiver.recv().await {
            self.handle_message(msg).await;
        }
        info!("EmbeddingCache stopped for round '{}'", self.round_id);
    }

    async fn handle_message(&mut self, msg: CacheMessage) {
        match msg {
            CacheMessage::GetOrCompute {
                texts,
                model_id,
                responder,
            } => {
                let result = self.get_or_compute(texts, model_id).await;
                if responder.send(result).is_err() {
                    warn!("Failed to send embedding response (channel closed)");
                }
            }
            CacheMessage::Invalidate { keys, responder } => {
                let result = self.invalidate(keys).await;
                if responder.send(result).is_err() {
                    warn!("Failed to send invalidate response (channel closed)");
                }
            }
            CacheMessage::InvalidateModel { responder } => {
                let result = self.invalidate_model().await;
                if responder.send(result).is_err() {
                    warn!("Failed to send invalidate-model response (channel closed)");
                }
            }
            CacheMessage::Stats { responder } => {
                if responder.send(self.stats).is_err() {
                    warn!("Failed to send stats response (channel closed)");
                }
            }
        }
    }

    /// Registers the provider's model on first use and refuses to mix dimensions.
    async fn ensure_model_registered(&mut self) -> Result<usize, AppError> {
        if let Some(dimension) = self.registered_dimension {
            return Ok(dimension);
        }
        let model_id = self.provider.model_id().to_string();
        let expected = self.provider.dimension();
        let dimension = match self.store.registered_dimension(&model_id).await? {
            Some(dimension) if dimension == expected => dimension,
            Some(dimension) => {
                return Err(AppError::CacheCorruption(format!(
                    "model '{}' is registered with dimension {} but the provider produces {}; invalidate the model before reusing this cache",
                    model_id, dimension, expected
                )));
            }
            None => {
                self.store.register_model(&model_id, expected).await?;
                info!("Registered embedding model '{}' ({} dims)", model_id, expected);
                expected
            }
        };
        self.registered_dimension = Some(dimension);
        Ok(dimension)
    }

    async fn get_or_compute(
        &mut self,
        texts: Vec<String>,
        model_id: String,
    ) -> Result<EmbeddingBatch, AppError> {
        if model_id != self.provider.model_id() {
            return Err(AppError::Validation(format!(
                "requested model '{}' but the cache is bound to '{}'",
                model_id,
                self.provider.model_id()
            )));
        }
        let dimension = self.ensure_model_registered().await?;

        let mut batch = EmbeddingBatch::with_len(texts.len());
        let request = index_request(&texts, &model_id, &mut batch);

        // 1. In-process LRU
        let mut pending = Vec::new();
        for (key, text) in request.unique.iter() {
            match self.memory.get(key) {
                Some(vector) => {
                    batch.stats.memory_hits += 1;
                    assign(&mut batch, &request, key, vector);
                }
                None => pending.push((key.clone(), text.clone())),
            }
        }

        // 2. Persistent store for this round
        let mut misses = Vec::new();
        if !pending.is_empty() {
            let keys: Vec<CacheKey> = pending.iter().map(|(k, _)| k.clone()).collect();
            let stored = self.store.get_many(&self.round_id, &keys).await?;
            for (key, text) in pending {
                let Some(entry) = stored.get(&key) else {
                    misses.push((key, text));
                    continue;
                };
                match decode_entry(entry, &model_id, dimension) {
                    Ok(vector) => {
                        batch.stats.store_hits += 1;
                        let vector: Arc<[f32]> = Arc::from(vector);
                        self.memory.put(key.clone(), Arc::clone(&vector));
                        assign(&mut batch, &request, &key, &vector);
                    }
                    Err(message) => {
                        warn!(
                            "Corrupted cache entry {} in round '{}': {}",
                            key, self.round_id, message
                        );
                        batch.stats.failed += 1;
                        fail(&mut batch, &request, &key, FailureKind::Corrupted { message });
                    }
                }
            }
        }

        // 3. Provider, one call per batch of misses
        if !misses.is_empty() {
            debug!(
                "Computing {} embeddings in batches of {}",
                misses.len(),
                self.batch_size
            );
        }
        for chunk in misses.chunks(self.batch_size) {
            let inputs: Vec<String> = chunk.iter().map(|(_, text)| text.clone()).collect();
            batch.stats.provider_calls += 1;
            let results = self.call_provider(&inputs).await;

            let mut to_store = Vec::new();
            for ((key, _), result) in chunk.iter().zip(results) {
                match result.and_then(|v| check_vector(v, dimension)) {
                    Ok(vector) => {
                        batch.stats.computed += 1;
                        to_store.push((key.clone(), StoredVector::encode(&model_id, &vector)));
                        let vector: Arc<[f32]> = Arc::from(vector);
                        self.memory.put(key.clone(), Arc::clone(&vector));
                        assign(&mut batch, &request, key, &vector);
                    }
                    Err(message) => {
                        batch.stats.failed += 1;
                        fail(&mut batch, &request, key, FailureKind::Provider { message });
                    }
                }
            }
            if !to_store.is_empty() {
                self.store.put_many(&self.round_id, &to_store).await?;
            }
        }

        batch.failures.sort_by_key(|f| f.index);
        self.stats += batch.stats;
        info!(
            "Embeddings for {} texts: {} memory hits, {} store hits, {} computed, {} failed",
            texts.len(),
            batch.stats.memory_hits,
            batch.stats.store_hits,
            batch.stats.computed,
            batch.stats.failed
        );
        Ok(batch)
    }

    async fn call_provider(&self, inputs: &[String]) -> Vec<ItemResult> {
        match self.provider.embed(inputs).await {
            Ok(items) if items.len() == inputs.len() => items,
            Ok(items) => {
                let message = format!(
                    "provider returned {} results for {} texts",
                    items.len(),
                    inputs.len()
                );
                warn!("{}", message);
                vec![Err(message); inputs.len()]
            }
            Err(e) => {
                warn!("Embedding batch of {} texts failed: {}", inputs.len(), e);
                vec![Err(e.to_string()); inputs.len()]
            }
        }
    }

    async fn invalidate(&mut self, keys: Vec<CacheKey>) -> Result<u64, AppError> {
        warn!(
            "Explicit recompute requested for {} cache keys in round '{}'",
            keys.len(),
            self.round_id
        );
        for key in &keys {
            self.memory.pop(key);
        }
        self.store.invalidate(&self.round_id, &keys).await
    }

    async fn invalidate_model(&mut self) -> Result<u64, AppError> {
        let model_id = self.provider.model_id().to_string();
        warn!("Invalidating every cached vector of model '{}'", model_id);
        self.memory.clear();
        self.registered_dimension = None;
        self.store.invalidate_model(&model_id).await
    }
}

/// Deduplicates the request by key; empty texts fail immediately.
fn index_request(
    texts: &[String],
    model_id: &str,
    batch: &mut EmbeddingBatch,
) -> RequestIndex {
    let mut positions: HashMap<CacheKey, Vec<usize>> = HashMap::new();
    let mut unique = Vec::new();
    for (index, text) in texts.iter().enumerate() {
        let key = CacheKey::compute(text, model_id);
        if text.is_empty() {
            batch.stats.failed += 1;
            batch.failures.push(EmbeddingFailure {
                index,
                text: text.clone(),
                key,
                kind: FailureKind::Provider {
                    message: "empty text".to_string(),
                },
            });
            continue;
        }
        match positions.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(vec![index]);
                unique.push((key, text.clone()));
            }
            Entry::Occupied(mut slot) => slot.get_mut().push(index),
        }
    }
    RequestIndex { positions, unique }
}

fn assign(batch: &mut EmbeddingBatch, request: &RequestIndex, key: &CacheKey, vector: &Arc<[f32]>) {
    if let Some(indexes) = request.positions.get(key) {
        for &index in indexes {
            batch.vectors[index] = Some(Arc::clone(vector));
        }
    }
}

fn fail(batch: &mut EmbeddingBatch, request: &RequestIndex, key: &CacheKey, kind: FailureKind) {
    let Some(indexes) = request.positions.get(key) else {
        return;
    };
    let text = request
        .unique
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, t)| t.clone())
        .unwrap_or_default();
    for &index in indexes {
        batch.failures.push(EmbeddingFailure {
            index,
            text: text.clone(),
            key: key.clone(),
            kind: kind.clone(),
        });
    }
}

fn decode_entry(entry: &StoredVector, model_id: &str, dimension: usize) -> Result<Vec<f32>, String> {
    if entry.model_id != model_id {
        return Err(format!("entry was written by model '{}'", entry.model_id));
    }
    entry.decode(dimension)
}

fn check_vector(vector: Vec<f32>, dimension: usize) -> Result<Vec<f32>, String> {
    if vector.len() != dimension {
        return Err(format!(
            "expected {} dimensions, got {}",
            dimension,
            vector.len()
        ));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err("vector contains non-finite values".to_string());
    }
    Ok(vector)
}
