//! # Pipeline
//!
//! Orchestrates the phases over a [`Corpus`]:
//!
//! - `stage_a`: normalize, embed and cluster the whole corpus coarsely
//! - `stage_b`: re-cluster each direction's phrase subset finely
//! - `resplit`: split oversized clusters one level down
//!
//! Phases exchange explicit, serializable results and can run in separate
//! processes. Clustering runs on the blocking pool.

pub mod corpus;
pub mod directions;
pub mod report;
pub mod resplit;
pub mod stage_a;
pub mod stage_b;

pub use corpus::{Corpus, CorpusOptions, RawPhraseRecord};
pub use report::{ExcludedPhrase, ExclusionReason, StageReport};
pub use resplit::{ResplitRow, ResplitRun};
pub use stage_a::{AssignmentRow, StageAResult};
pub use stage_b::{DirectionResult, StageBResult, StageBRow};

use crate::actors::cache::EmbeddingCacheHandle;
use crate::actors::messages::{CacheStats, FailureKind};
use crate::clustering::{
    ClusterOutcome, ClusterParams, ClusterSummarizer, ClusteringEngine, EmbeddedGroup,
    ParameterSelector, Resplitter,
};
use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::models::{Cluster, ClusterId, NormalizedPhrase, PhraseId, Stage, NOISE_LABEL};
use crate::text::{Preprocessed, TextPreprocessor};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// Vectors for a phrase set, grouped by normalized text.
#[derive(Debug, Default)]
struct Embedded {
    groups: Vec<EmbeddedGroup>,
    excluded: Vec<ExcludedPhrase>,
    stats: CacheStats,
}

/// The configured phases. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Pipeline {
    round_id: String,
    cache: EmbeddingCacheHandle,
    engine: ClusteringEngine,
    preprocessor: TextPreprocessor,
    summarizer: ClusterSummarizer,
    coarse: ParameterSelector,
    fine: ParameterSelector,
    resplitter: Resplitter,
    max_failure_rate: f64,
    stage_b_parallelism: usize,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        cache: EmbeddingCacheHandle,
        engine: ClusteringEngine,
    ) -> Result<Self, AppError> {
        config.check()?;
        if cache.round_id() != config.round_id {
            return Err(AppError::Config(format!(
                "Cache is bound to round '{}' but the pipeline runs round '{}'",
                cache.round_id(),
                config.round_id
            )));
        }
        if cache.model_id() != config.embedding.model_id {
            return Err(AppError::Config(format!(
                "Cache provider model '{}' differs from configured model '{}'",
                cache.model_id(),
                config.embedding.model_id
            )));
        }
        Ok(Self {
            round_id: config.round_id.clone(),
            resplitter: Resplitter::new(
                engine.clone(),
                ParameterSelector::new(config.resplit)?,
                config.resplit_threshold,
            ),
            cache,
            engine,
            preprocessor: TextPreprocessor::with_bounds(config.phrase_length),
            summarizer: ClusterSummarizer::new(config.example_count),
            coarse: ParameterSelector::new(config.coarse)?,
            fine: ParameterSelector::new(config.fine)?,
            max_failure_rate: config.embedding.max_failure_rate,
            stage_b_parallelism: config.stage_b_parallelism,
        })
    }

    pub fn round_id(&self) -> &str {
        &self.round_id
    }

    pub fn cache(&self) -> &EmbeddingCacheHandle {
        &self.cache
    }

    pub fn resplitter(&self) -> &Resplitter {
        &self.resplitter
    }

    /// Fetches or computes vectors for `normalized` (ascending phrase id) and
    /// groups phrases by text. Phrases whose vector is missing are excluded.
    async fn embed(&self, normalized: &[NormalizedPhrase]) -> Result<Embedded, AppError> {
        let mut texts: Vec<String> = Vec::new();
        let mut members: Vec<Vec<PhraseId>> = Vec::new();
        let mut position: HashMap<&str, usize> = HashMap::new();
        for phrase in normalized {
            let slot = *position.entry(phrase.text.as_str()).or_insert_with(|| {
                texts.push(phrase.text.clone());
                members.push(Vec::new());
                texts.len() - 1
            });
            members[slot].push(phrase.phrase_id);
        }
        if texts.is_empty() {
            return Ok(Embedded::default());
        }

        let batch = self
            .cache
            .get_or_compute(texts, self.cache.model_id())
            .await?;

        let failures: HashMap<usize, &FailureKind> =
            batch.failures.iter().map(|f| (f.index, &f.kind)).collect();
        let mut embedded = Embedded {
            stats: batch.stats,
            ..Embedded::default()
        };
        let mut provider_failed = 0usize;

        for (index, (vector, phrase_ids)) in batch.vectors.iter().zip(members).enumerate() {
            if let Some(vector) = vector {
                embedded.groups.push(EmbeddedGroup {
                    phrase_ids,
                    vector: vector.clone(),
                });
                continue;
            }
            let (reason, detail) = match failures.get(&index) {
                Some(FailureKind::Corrupted { message }) => {
                    (ExclusionReason::CacheCorrupted, message.clone())
                }
                Some(FailureKind::Provider { message }) => {
                    provider_failed += phrase_ids.len();
                    (ExclusionReason::EmbeddingFailed, message.clone())
                }
                None => {
                    provider_failed += phrase_ids.len();
                    (ExclusionReason::EmbeddingFailed, "No vector returned".to_string())
                }
            };
            embedded
                .excluded
                .extend(phrase_ids.into_iter().map(|phrase_id| ExcludedPhrase {
                    phrase_id,
                    reason,
                    detail: Some(detail.clone()),
                }));
        }

        let corrupted = embedded
            .excluded
            .iter()
            .filter(|e| e.reason == ExclusionReason::CacheCorrupted)
            .count();
        if corrupted > 0 {
            warn!(
                phrases = corrupted,
                "Excluding phrases with corrupted cache entries; invalidate them to recompute"
            );
        }

        let rate = provider_failed as f64 / normalized.len() as f64;
        if rate > self.max_failure_rate {
            return Err(AppError::EmbeddingProvider(format!(
                "{} of {} phrases failed to embed ({:.1}% > {:.1}% allowed)",
                provider_failed,
                normalized.len(),
                rate * 100.0,
                self.max_failure_rate * 100.0
            )));
        }
        if provider_failed > 0 {
            warn!(phrases = provider_failed, "Excluding phrases the provider could not embed");
        }
        Ok(embedded)
    }

    /// Clusters `groups` on the blocking pool.
    async fn cluster_blocking(
        &self,
        groups: Vec<EmbeddedGroup>,
        params: ClusterParams,
    ) -> Result<(ClusterOutcome, BTreeMap<i32, BTreeSet<PhraseId>>), AppError> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.cluster_groups(&groups, &params)).await?
    }
}

/// Clusters `0..n_clusters` in label order, then noise when it has members.
fn build_clusters(
    stage: Stage,
    n_clusters: usize,
    mut members: BTreeMap<i32, BTreeSet<PhraseId>>,
) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = (0..n_clusters as i32)
        .filter_map(|label| {
            members
                .remove(&label)
                .map(|ids| Cluster::new(ClusterId::from_label(label), stage, ids))
        })
        .collect();
    if let Some(noise) = members.remove(&NOISE_LABEL) {
        clusters.push(Cluster::new(ClusterId::noise(), stage, noise));
    }
    clusters
}

/// Exclusions for phrases dropped before embedding.
fn preprocess_exclusions(preprocessed: &Preprocessed) -> Vec<ExcludedPhrase> {
    let excluded = |ids: &[PhraseId], reason: ExclusionReason| -> Vec<ExcludedPhrase> {
        ids.iter()
            .map(|&phrase_id| ExcludedPhrase {
                phrase_id,
                reason,
                detail: None,
            })
            .collect()
    };
    let mut all = excluded(&preprocessed.out_of_bounds, ExclusionReason::LengthOutOfBounds);
    all.extend(excluded(&preprocessed.empty, ExclusionReason::EmptyAfterNormalization));
    all
}
