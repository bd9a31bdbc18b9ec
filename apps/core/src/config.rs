//! Run configuration.
//!
//! Values come from `Default`, then `.env`, then `PHRASEMAP_*` variables. The
//! result is validated once and then passed by value into the pipeline.

use crate::actors::cache::CacheOptions;
use crate::clustering::engine::DEFAULT_SILHOUETTE_MAX_POINTS;
use crate::clustering::resplit::DEFAULT_RESPLIT_THRESHOLD;
use crate::clustering::summary::DEFAULT_EXAMPLE_COUNT;
use crate::clustering::SelectorProfile;
use crate::error::AppError;
use crate::fs_manager::DataLayout;
use crate::text::LengthBounds;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

pub const ENV_PREFIX: &str = "PHRASEMAP_";
pub const DEFAULT_MODEL_ID: &str = "bge-small-en-v1.5";
pub const DEFAULT_MAX_FAILURE_RATE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Local ONNX model through fastembed.
    #[default]
    Fastembed,
    /// OpenAI-compatible HTTP endpoint.
    Http,
}

impl FromStr for ProviderKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fastembed" | "local" => Ok(ProviderKind::Fastembed),
            "http" | "remote" => Ok(ProviderKind::Http),
            other => Err(AppError::Config(format!("Unknown embedding provider '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EmbeddingConfig {
    #[validate(length(min = 1))]
    pub model_id: String,
    pub provider: ProviderKind,
    /// API root for the HTTP provider.
    #[validate(url)]
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Required for the HTTP provider; fastembed knows its own.
    #[validate(range(min = 1))]
    pub dimension: Option<usize>,
    #[validate(range(min = 1, max = 4096))]
    pub batch_size: usize,
    #[validate(range(min = 1))]
    pub lru_capacity: usize,
    /// Share of phrases whose embedding may fail before the stage fails.
    #[validate(range(min = 0.0, max = 1.0))]
    pub max_failure_rate: f64,
    #[validate(range(min = 1, max = 600))]
    pub request_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache = CacheOptions::default();
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            provider: ProviderKind::Fastembed,
            endpoint: None,
            api_key: None,
            dimension: None,
            batch_size: cache.batch_size,
            lru_capacity: cache.lru_capacity.get(),
            max_failure_rate: DEFAULT_MAX_FAILURE_RATE,
            request_timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn cache_options(&self) -> CacheOptions {
        let defaults = CacheOptions::default();
        CacheOptions {
            batch_size: self.batch_size,
            lru_capacity: NonZeroUsize::new(self.lru_capacity).unwrap_or(defaults.lru_capacity),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    /// Partition key for cached vectors and output artifacts.
    #[validate(length(min = 1, max = 128))]
    pub round_id: String,
    #[validate(nested)]
    pub embedding: EmbeddingConfig,
    #[validate(nested)]
    pub coarse: SelectorProfile,
    #[validate(nested)]
    pub fine: SelectorProfile,
    #[validate(nested)]
    pub resplit: SelectorProfile,
    #[validate(range(min = 2))]
    pub silhouette_max_points: usize,
    #[validate(range(min = 1, max = 50))]
    pub example_count: usize,
    #[validate(range(min = 1))]
    pub resplit_threshold: usize,
    #[validate(range(min = 1, max = 64))]
    pub stage_b_parallelism: usize,
    pub merge_duplicates: bool,
    /// Raw phrase length accepted for embedding.
    #[serde(default)]
    pub phrase_length: LengthBounds,
    pub data_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            round_id: "default".to_string(),
            embedding: EmbeddingConfig::default(),
            coarse: SelectorProfile::coarse(),
            fine: SelectorProfile::fine(),
            resplit: SelectorProfile::resplit(),
            silhouette_max_points: DEFAULT_SILHOUETTE_MAX_POINTS,
            example_count: DEFAULT_EXAMPLE_COUNT,
            resplit_threshold: DEFAULT_RESPLIT_THRESHOLD,
            stage_b_parallelism: 4,
            merge_duplicates: true,
            phrase_length: LengthBounds::default(),
            data_dir: PathBuf::from("data"),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `.env` and the process environment.
    pub fn from_env() -> Result<Self, AppError> {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        if let Some(v) = env_var("ROUND_ID") {
            config.round_id = v;
        }
        if let Some(v) = env_var("DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("MODEL_ID") {
            config.embedding.model_id = v;
        }
        if let Some(v) = env_parse::<ProviderKind>("PROVIDER")? {
            config.embedding.provider = v;
        }
        if let Some(v) = env_var("EMBEDDING_URL") {
            config.embedding.endpoint = Some(v);
        }
        if let Some(v) = env_var("API_KEY") {
            config.embedding.api_key = Some(v);
        }
        if let Some(v) = env_parse("EMBEDDING_DIMENSION")? {
            config.embedding.dimension = Some(v);
        }
        if let Some(v) = env_parse("BATCH_SIZE")? {
            config.embedding.batch_size = v;
        }
        if let Some(v) = env_parse("LRU_CAPACITY")? {
            config.embedding.lru_capacity = v;
        }
        if let Some(v) = env_parse("MAX_FAILURE_RATE")? {
            config.embedding.max_failure_rate = v;
        }
        if let Some(v) = env_parse("REQUEST_TIMEOUT_SECS")? {
            config.embedding.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("SILHOUETTE_MAX_POINTS")? {
            config.silhouette_max_points = v;
        }
        if let Some(v) = env_parse("EXAMPLE_COUNT")? {
            config.example_count = v;
        }
        if let Some(v) = env_parse("RESPLIT_THRESHOLD")? {
            config.resplit_threshold = v;
        }
        if let Some(v) = env_parse("STAGE_B_PARALLELISM")? {
            config.stage_b_parallelism = v;
        }
        if let Some(v) = env_parse("MERGE_DUPLICATES")? {
            config.merge_duplicates = v;
        }
        if let Some(v) = env_parse("MIN_PHRASE_CHARS")? {
            config.phrase_length.min_chars = v;
        }
        if let Some(v) = env_parse("MAX_PHRASE_CHARS")? {
            config.phrase_length.max_chars = v;
        }

        config.check()?;
        Ok(config)
    }

    /// Field validation plus the rules that span fields.
    pub fn check(&self) -> Result<(), AppError> {
        self.validate()?;
        for profile in [&self.coarse, &self.fine, &self.resplit] {
            profile.check()?;
        }
        self.phrase_length.check()?;
        if self.embedding.provider == ProviderKind::Http {
            if self.embedding.endpoint.is_none() {
                return Err(AppError::Config(format!(
                    "{}EMBEDDING_URL is required for the http provider",
                    ENV_PREFIX
                )));
            }
            if self.embedding.dimension.is_none() {
                return Err(AppError::Config(format!(
                    "{}EMBEDDING_DIMENSION is required for the http provider",
                    ENV_PREFIX
                )));
            }
        }
        if self.round_id.contains(['/', '\\']) || self.round_id.trim() != self.round_id {
            return Err(AppError::Config(format!(
                "round_id '{}' must be a plain name",
                self.round_id
            )));
        }
        Ok(())
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(self.data_dir.clone())
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, suffix))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(suffix: &str) -> Result<Option<T>, AppError>
where
    T::Err: std::fmt::Display,
{
    match env_var(suffix) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            AppError::Config(format!("Invalid {}{}='{}': {}", ENV_PREFIX, suffix, raw, e))
        }),
    }
}
