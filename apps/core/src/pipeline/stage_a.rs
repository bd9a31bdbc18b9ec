use super::report::{ExcludedPhrase, StageReport};
use super::{build_clusters, preprocess_exclusions, Corpus, Pipeline};
use crate::clustering::ClusterParams;
use crate::error::AppError;
use crate::models::{Cluster, ClusterId, ClusterSummary, PhraseId, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRow {
    pub phrase_id: PhraseId,
    pub cluster_id: ClusterId,
    pub is_noise: bool,
}

/// Output of the coarse pass; the input artifact for direction selection and
/// Stage B.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageAResult {
    pub round_id: String,
    pub generation: Uuid,
    pub created_at: DateTime<Utc>,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ClusterParams>,
    /// Sorted by phrase id; excluded phrases have no row.
    pub assignments: Vec<AssignmentRow>,
    pub clusters: Vec<Cluster>,
    pub summaries: Vec<ClusterSummary>,
    pub excluded: Vec<ExcludedPhrase>,
    pub report: StageReport,
}

impl StageAResult {
    pub fn cluster(&self, id: &ClusterId) -> Option<&Cluster> {
        self.clusters.iter().find(|c| &c.cluster_id == id)
    }

    /// Stage-A cluster of each assigned phrase.
    pub fn assignment_index(&self) -> HashMap<PhraseId, &ClusterId> {
        self.assignments
            .iter()
            .map(|row| (row.phrase_id, &row.cluster_id))
            .collect()
    }
}

impl Pipeline {
    #[instrument(skip_all, fields(round_id = %self.round_id, phrases = corpus.len()))]
    pub async fn run_stage_a(&self, corpus: &Corpus) -> Result<StageAResult, AppError> {
        if corpus.is_empty() {
            return Err(AppError::Validation("Corpus has no phrases".to_string()));
        }
        let generation = Uuid::new_v4();
        let mut report = StageReport::new(Stage::A, &self.round_id, generation, corpus.len());

        let preprocessed = self.preprocessor.normalize_all(corpus.phrases());
        let mut excluded = preprocess_exclusions(&preprocessed);
        if !preprocessed.out_of_bounds.is_empty() {
            let bounds = self.preprocessor.bounds();
            warn!(
                count = preprocessed.out_of_bounds.len(),
                min_chars = bounds.min_chars,
                max_chars = bounds.max_chars,
                "Phrases outside the length bounds"
            );
        }
        if !preprocessed.empty.is_empty() {
            warn!(count = preprocessed.empty.len(), "Phrases empty after normalization");
        }

        let embedded = self.embed(&preprocessed.kept).await?;
        report.cache = embedded.stats;
        excluded.extend(embedded.excluded);
        excluded.sort_by_key(|e| e.phrase_id);
        report.record_exclusions(&excluded);

        let (clusters, params) = if embedded.groups.is_empty() {
            report.warn("No phrases left to cluster");
            (Vec::new(), None)
        } else {
            let params = self.coarse.select(embedded.groups.len());
            info!(
                points = embedded.groups.len(),
                min_cluster_size = params.min_cluster_size,
                min_samples = params.min_samples,
                "Stage A clustering"
            );
            let (outcome, members) = self.cluster_blocking(embedded.groups, params).await?;
            report.record_outcome(&outcome);
            (build_clusters(Stage::A, outcome.n_clusters, members), Some(params))
        };
        report.record_clusters(&clusters);

        let mut assignments: Vec<AssignmentRow> = clusters
            .iter()
            .flat_map(|cluster| {
                cluster.member_phrase_ids.iter().map(|&phrase_id| AssignmentRow {
                    phrase_id,
                    cluster_id: cluster.cluster_id.clone(),
                    is_noise: cluster.is_noise,
                })
            })
            .collect();
        assignments.sort_by_key(|row| row.phrase_id);

        let summaries = self.summarizer.summarize_all(&clusters, corpus.phrases(), None)?;

        info!(
            clusters = report.cluster_count,
            noise = report.noise_phrases,
            excluded = report.excluded_total(),
            "Stage A complete"
        );
        Ok(StageAResult {
            round_id: self.round_id.clone(),
            generation,
            created_at: Utc::now(),
            model_id: self.cache.model_id().to_string(),
            params,
            assignments,
            clusters,
            summaries,
            excluded,
            report,
        })
    }
}
