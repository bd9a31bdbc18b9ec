use super::report::StageReport;
use super::{Corpus, Pipeline};
use crate::clustering::{ResplitOutcome, ResplitResult};
use crate::error::AppError;
use crate::models::{Cluster, ClusterId, ClusterSummary, NormalizedPhrase, PhraseId, Stage};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResplitRow {
    pub phrase_id: PhraseId,
    pub parent_cluster_id: ClusterId,
    pub cluster_id: ClusterId,
}

/// One applied resplit with its summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResplitRun {
    pub parent: ClusterId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction_keyword: Option<String>,
    pub clusters: Vec<Cluster>,
    pub summaries: Vec<ClusterSummary>,
    pub rows: Vec<ResplitRow>,
    pub report: StageReport,
}

impl Pipeline {
    /// Resplits `cluster` when it is over the threshold; `Ok(None)` otherwise.
    /// Members whose vectors cannot be produced end up in the resplit noise.
    #[instrument(skip_all, fields(cluster = %cluster.cluster_id))]
    pub async fn resplit(
        &self,
        corpus: &Corpus,
        cluster: &Cluster,
        direction_keyword: Option<&str>,
    ) -> Result<Option<ResplitRun>, AppError> {
        if cluster.is_noise {
            return Err(AppError::Validation(format!(
                "Cluster {} is noise and cannot be resplit",
                cluster.cluster_id
            )));
        }
        if !self.resplitter.applies_to(cluster) {
            return Ok(None);
        }

        let generation = Uuid::new_v4();
        let mut report = StageReport::new(Stage::Resplit, &self.round_id, generation, cluster.size());
        report.direction_keyword = direction_keyword.map(str::to_string);

        let normalized = cluster
            .member_phrase_ids
            .iter()
            .map(|&id| {
                corpus
                    .get(id)
                    .map(|phrase| self.preprocessor.normalize_phrase(phrase))
                    .ok_or_else(|| AppError::Validation(format!("Unknown phrase id {}", id)))
            })
            .filter(|p| p.as_ref().map_or(true, |p| !p.is_empty()))
            .collect::<Result<Vec<NormalizedPhrase>, AppError>>()?;

        let embedded = self.embed(&normalized).await?;
        report.cache = embedded.stats;
        for excluded in &embedded.excluded {
            report.warn(format!(
                "Phrase {} has no vector ({:?}), kept as resplit noise",
                excluded.phrase_id, excluded.reason
            ));
        }

        let resplitter = self.resplitter.clone();
        let parent = cluster.clone();
        let groups = embedded.groups;
        let outcome = tokio::task::spawn_blocking(move || resplitter.resplit(&parent, &groups)).await??;
        let ResplitOutcome::Split(ResplitResult {
            parent,
            clusters,
            outcome,
        }) = outcome
        else {
            return Ok(None);
        };
        report.record_outcome(&outcome);
        report.record_clusters(&clusters);

        let mut rows: Vec<ResplitRow> = clusters
            .iter()
            .flat_map(|sub| {
                sub.member_phrase_ids.iter().map(|&phrase_id| ResplitRow {
                    phrase_id,
                    parent_cluster_id: parent.clone(),
                    cluster_id: sub.cluster_id.clone(),
                })
            })
            .collect();
        rows.sort_by_key(|row| row.phrase_id);

        let summaries = self
            .summarizer
            .summarize_all(&clusters, corpus.phrases(), direction_keyword)?;

        info!(
            parent = %parent,
            sub_clusters = report.cluster_count,
            noise = report.noise_phrases,
            "Cluster resplit"
        );
        Ok(Some(ResplitRun {
            parent,
            direction_keyword: direction_keyword.map(str::to_string),
            clusters,
            summaries,
            rows,
            report,
        }))
    }

    /// Applies [`Pipeline::resplit`] to every cluster over the threshold. Sub-clusters
    /// are not resplit again.
    pub async fn resplit_oversized(
        &self,
        corpus: &Corpus,
        clusters: &[Cluster],
        direction_keyword: Option<&str>,
    ) -> Result<Vec<ResplitRun>, AppError> {
        let mut runs = Vec::new();
        for cluster in clusters.iter().filter(|c| self.resplitter.applies_to(c)) {
            if let Some(run) = self.resplit(corpus, cluster, direction_keyword).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }
}
