//! # Embedding Module
//!
//! - `provider`: the `EmbeddingProvider` capability and the local fastembed backend
//! - `http`: OpenAI-compatible remote backend
//! - `store`: content-addressed vector store (SQLite and in-memory)
//!
//! The cache that ties providers and stores together runs as an actor, see
//! [`crate::actors::cache`].

pub mod http;
pub mod provider;
pub mod store;

pub use http::HttpEmbeddingProvider;
pub use provider::{EmbeddingProvider, FastEmbedProvider, ItemResult};
pub use store::{CacheKey, InMemoryVectorStore, SqliteVectorStore, StoredVector, VectorStore};
