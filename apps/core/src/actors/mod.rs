//! # Actors
//!
//! - `cache`: the embedding cache actor and its cloneable handle
//! - `messages`: message enums, responses and actor errors

pub mod cache;
pub mod messages;

pub use cache::{CacheOptions, EmbeddingCacheHandle};
pub use messages::{CacheStats, EmbeddingBatch, EmbeddingFailure, FailureKind};
