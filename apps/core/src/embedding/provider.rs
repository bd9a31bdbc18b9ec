use crate::error::AppError;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome for one input text: the vector, or why it could not be produced.
pub type ItemResult = Result<Vec<f32>, String>;

/// Defines the public interface for an embedding backend.
///
/// Implementations must be deterministic for a fixed `model_id`. `embed` returns one
/// result per input, in input order; an outer `Err` means the whole batch failed.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync + 'static {
    /// Identity of the model, part of every cache key.
    fn model_id(&self) -> &str;

    /// Length of every vector this provider produces.
    fn dimension(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<ItemResult>, AppError>;
}

/// Maps a model identifier to the fastembed model and its output dimension.
pub fn resolve_fastembed_model(model_id: &str) -> Result<(EmbeddingModel, usize), AppError> {
    match model_id {
        "all-MiniLM-L6-v2" => Ok((EmbeddingModel::AllMiniLML6V2, 384)),
        "all-MiniLM-L12-v2" => Ok((EmbeddingModel::AllMiniLML12V2, 384)),
        "bge-small-en-v1.5" => Ok((EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((EmbeddingModel::BGEBaseENV15, 768)),
        other => Err(AppError::Config(format!(
            "Unsupported local embedding model '{}'",
            other
        ))),
    }
}

/// Local ONNX sentence embeddings through fastembed.
pub struct FastEmbedProvider {
    model: Arc<TextEmbedding>,
    model_id: String,
    dimension: usize,
}

impl FastEmbedProvider {
    /// Loads the model, downloading it into `cache_dir` on first use.
    pub async fn load(model_id: &str, cache_dir: PathBuf) -> Result<Self, AppError> {
        let (kind, dimension) = resolve_fastembed_model(model_id)?;

        let model = tokio::task::spawn_blocking(move || {
            let mut options = InitOptions::new(kind);
            options.show_download_progress = false;
            options.cache_dir = cache_dir;
            TextEmbedding::try_new(options)
        })
        .await?
        .map_err(|e| AppError::EmbeddingProvider(format!("Failed to load embedding model: {}", e)))?;

        info!("Embedding model '{}' loaded ({} dims)", model_id, dimension);
        Ok(Self {
            model: Arc::new(model),
            model_id: model_id.to_string(),
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<ItemResult>, AppError> {
        let model = Arc::clone(&self.model);
        let batch = texts.to_vec();
        let results = tokio::task::spawn_blocking(move || embed_isolating_failures(&model, batch)).await?;
        Ok(results)
    }
}

/// Embeds a batch; if the batch call fails, retries item by item so one bad text
/// does not take down its neighbours.
fn embed_isolating_failures(model: &TextEmbedding, texts: Vec<String>) -> Vec<ItemResult> {
    let count = texts.len();
    match model.embed(texts.clone(), None) {
        Ok(vectors) if vectors.len() == count => vectors.into_iter().map(Ok).collect(),
        Ok(vectors) => {
            let message = format!("model returned {} vectors for {} texts", vectors.len(), count);
            vec![Err(message); count]
        }
        Err(e) if count == 1 => vec![Err(e.to_string())],
        Err(e) => {
            warn!("Embedding batch of {} failed ({}), retrying items individually", count, e);
            texts
                .into_iter()
                .map(|text| match model.embed(vec![text], None) {
                    Ok(mut vectors) => vectors.pop().ok_or_else(|| "model returned no vector".to_string()),
                    Err(e) => Err(e.to_string()),
                })
                .collect()
        }
    }
}
