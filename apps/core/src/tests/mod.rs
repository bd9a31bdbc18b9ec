//! Test Module
//!
//! Cross-module test suite for phrasemap-core.
//!
//! ## Test Categories
//! - `preprocess_tests`: normalization idempotence and keyword matching
//! - `cache_tests`: embedding cache actor, stores, failures and invalidation
//! - `clustering_tests`: engine determinism, partitions and degenerate input
//! - `pipeline_tests`: Stage A, Stage B and resplit end to end with a mock provider
//! - `provider_tests`: HTTP embedding provider against a mock server
//! - `config_tests`: environment overlay and validation

pub mod config_tests;
pub mod pipeline_tests;
