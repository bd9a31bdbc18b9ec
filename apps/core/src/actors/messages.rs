use crate::embedding::store::CacheKey;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Defines errors that can occur within the actor system.
#[derive(Debug, thiserror::Error, Serialize, Clone)]
pub enum ActorError {
    /// The actor task is gone; its channel is closed.
    #[error("Actor unavailable: {0}")]
    Closed(String),
    /// A generic internal error within an actor.
    #[error("Internal system error: {0}")]
    Internal(String),
}

// Re-export AppError for convenience
pub use crate::error::AppError;

/// Why a text did not get a vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The provider rejected the item or its whole batch.
    Provider { message: String },
    /// The stored vector for this key is unreadable; needs an explicit invalidate.
    Corrupted { message: String },
}

/// A per-key failure, reported alongside the partial results.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingFailure {
    /// Position in the request.
    pub index: usize,
    pub text: String,
    pub key: CacheKey,
    pub kind: FailureKind,
}

/// Lookup and computation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub store_hits: u64,
    pub computed: u64,
    pub failed: u64,
    pub provider_calls: u64,
}

impl AddAssign for CacheStats {
    fn add_assign(&mut self, other: Self) {
        self.memory_hits += other.memory_hits;
        self.store_hits += other.store_hits;
        self.computed += other.computed;
        self.failed += other.failed;
        self.provider_calls += other.provider_calls;
    }
}

/// Result of `get_or_compute`: one slot per requested text plus the failures.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Option<Arc<[f32]>>>,
    pub failures: Vec<EmbeddingFailure>,
    /// Counters for this call only.
    pub stats: CacheStats,
}

impl EmbeddingBatch {
    pub(crate) fn with_len(len: usize) -> Self {
        Self {
            vectors: vec![None; len],
            failures: Vec::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn failed_keys(&self) -> Vec<&CacheKey> {
        self.failures.iter().map(|f| &f.key).collect()
    }

    pub fn resolved_count(&self) -> usize {
        self.vectors.iter().filter(|v| v.is_some()).count()
    }
}

/// Messages that can be sent to the embedding cache actor.
#[derive(Debug)]
pub enum CacheMessage {
    /// Fetch vectors for normalized texts, computing the misses.
    GetOrCompute {
        texts: Vec<String>,
        model_id: String,
        responder: oneshot::Sender<Result<EmbeddingBatch, AppError>>,
    },
    /// Explicitly drop keys from the round so they are recomputed.
    Invalidate {
        keys: Vec<CacheKey>,
        responder: oneshot::Sender<Result<u64, AppError>>,
    },
    /// Drop every vector of the provider's model and its registry entry.
    InvalidateModel {
        responder: oneshot::Sender<Result<u64, AppError>>,
    },
    /// Cumulative counters since the actor started.
    Stats {
        responder: oneshot::Sender<CacheStats>,
    },
}
