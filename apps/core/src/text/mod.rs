//! # Text Module
//!
//! - `normalizer`: deterministic phrase normalization (TextPreprocessor)
//! - `features`: word counts and question detection for summaries

pub mod features;
pub mod normalizer;

pub use normalizer::{contains_keyword, normalize, LengthBounds, Preprocessed, TextPreprocessor};
