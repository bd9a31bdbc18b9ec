//! # Clustering
//!
//! - `params`: size-adaptive hyperparameters
//! - `algorithm`: the `ClusterAlgorithm` seam and the HDBSCAN adapter
//! - `engine`: input checks, normalization, fallbacks and diagnostics
//! - `summary`: per-cluster statistics and table ordering
//! - `resplit`: one-level re-clustering of oversized clusters

pub mod algorithm;
pub mod engine;
pub mod params;
pub mod resplit;
pub mod summary;

pub use algorithm::{ClusterAlgorithm, Hdbscan};
pub use engine::{ClusterOutcome, ClusteringDiagnostic, ClusteringEngine, EmbeddedGroup};
pub use params::{ClusterParams, ParameterSelector, SelectionMethod, SelectorProfile};
pub use resplit::{ResplitOutcome, ResplitResult, Resplitter};
pub use summary::{rank_for_directions, ClusterSummarizer};
