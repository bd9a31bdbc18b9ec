// phrasemap core
// Two-stage semantic clustering of search-query phrases

pub mod actors;
pub mod clustering;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fs_manager;
pub mod models;
pub mod pipeline;
pub mod preflight;
pub mod run_logger;
pub mod telemetry;
pub mod text;

pub use config::PipelineConfig;
pub use error::AppError;
pub use pipeline::Pipeline;

#[cfg(test)]
mod tests;
