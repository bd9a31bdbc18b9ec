//! Remote embeddings over an OpenAI-compatible `/embeddings` endpoint.

use crate::embedding::provider::{EmbeddingProvider, ItemResult};
use crate::error::AppError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

pub struct HttpEmbeddingProvider {
    client: Client,
    endpoint: Url,
    model_id: String,
    dimension: usize,
    api_key: Option<String>,
}

impl HttpEmbeddingProvider {
    /// `base_url` is the API root (for example `http://localhost:8080/v1`).
    pub fn new(
        base_url: &str,
        model_id: &str,
        dimension: usize,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        if dimension == 0 {
            return Err(AppError::Config("Embedding dimension must be positive".to_string()));
        }
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("embeddings")?;
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            model_id: model_id.to_string(),
            dimension,
            api_key,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<ItemResult>, AppError> {
        debug!("POST {} ({} texts)", self.endpoint, texts.len());
        let mut request = self.client.post(self.endpoint.clone()).json(&EmbeddingRequest {
            model: &self.model_id,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::EmbeddingProvider(format!(
                "Embedding endpoint returned {}: {}",
                status, body
            )));
        }
        let payload: EmbeddingResponse = response.json().await?;

        let mut results: Vec<ItemResult> =
            vec![Err("missing from provider response".to_string()); texts.len()];
        for datum in payload.data {
            let Some(slot) = results.get_mut(datum.index) else {
                continue;
            };
            *slot = if datum.embedding.len() == self.dimension {
                Ok(datum.embedding)
            } else {
                Err(format!(
                    "expected {} dimensions, got {}",
                    self.dimension,
                    datum.embedding.len()
                ))
            };
        }
        Ok(results)
    }
}
