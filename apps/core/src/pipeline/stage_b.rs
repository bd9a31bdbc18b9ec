use super::directions::validate_directions;
use super::report::StageReport;
use super::stage_a::StageAResult;
use super::{build_clusters, Corpus, Pipeline};
use crate::clustering::ClusterParams;
use crate::error::AppError;
use crate::models::{Cluster, ClusterId, ClusterSummary, Direction, NormalizedPhrase, PhraseId, Stage};
use crate::text::contains_keyword;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageBRow {
    pub phrase_id: PhraseId,
    /// `None` when the phrase had no Stage-A assignment (excluded there).
    pub cluster_id_a: Option<ClusterId>,
    pub cluster_id_b: ClusterId,
    pub direction_keyword: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectionResult {
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ClusterParams>,
    /// Phrases matched through the keyword rather than Stage-A membership.
    pub keyword_matches: usize,
    pub clusters: Vec<Cluster>,
    pub summaries: Vec<ClusterSummary>,
    pub rows: Vec<StageBRow>,
    pub report: StageReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageBResult {
    pub round_id: String,
    pub generation: Uuid,
    pub created_at: DateTime<Utc>,
    pub stage_a_generation: Uuid,
    /// In direction input order.
    pub directions: Vec<DirectionResult>,
}

impl StageBResult {
    pub fn direction(&self, keyword: &str) -> Option<&DirectionResult> {
        self.directions
            .iter()
            .find(|d| d.direction.direction_keyword == keyword)
    }
}

impl Pipeline {
    /// Every direction is checked before any runs; one bad row stops the stage.
    #[instrument(skip_all, fields(round_id = %self.round_id, directions = directions.len()))]
    pub async fn run_stage_b(
        &self,
        corpus: &Corpus,
        stage_a: &StageAResult,
        directions: &[Direction],
    ) -> Result<StageBResult, AppError> {
        if directions.is_empty() {
            return Err(AppError::Validation("No directions given".to_string()));
        }
        validate_directions(directions)?;
        for direction in directions {
            self.check_direction(stage_a, direction)?;
        }

        let generation = Uuid::new_v4();
        // Normalized once; every direction scans the same texts.
        let normalized = self.preprocessor.normalize_all(corpus.phrases()).kept;
        let assignment = stage_a.assignment_index();
        let (normalized, assignment) = (&normalized, &assignment);

        let results: Vec<DirectionResult> = stream::iter(directions)
            .map(move |direction| {
                self.run_direction(corpus, stage_a, normalized, assignment, direction, generation)
            })
            .buffered(self.stage_b_parallelism)
            .try_collect()
            .await?;

        info!(directions = results.len(), "Stage B complete");
        Ok(StageBResult {
            round_id: self.round_id.clone(),
            generation,
            created_at: Utc::now(),
            stage_a_generation: stage_a.generation,
            directions: results,
        })
    }

    fn check_direction(&self, stage_a: &StageAResult, direction: &Direction) -> Result<(), AppError> {
        if direction.round_id != stage_a.round_id || direction.round_id != self.round_id {
            return Err(AppError::Validation(format!(
                "Direction '{}' belongs to round '{}', expected '{}'",
                direction.direction_keyword, direction.round_id, stage_a.round_id
            )));
        }
        if direction.source_cluster_id.is_noise() {
            return Err(AppError::Validation(format!(
                "Direction '{}' points at noise; noise is never a direction source",
                direction.direction_keyword
            )));
        }
        if stage_a.cluster(&direction.source_cluster_id).is_none() {
            return Err(AppError::Validation(format!(
                "Direction '{}' points at unknown Stage-A cluster {}",
                direction.direction_keyword, direction.source_cluster_id
            )));
        }
        if self.preprocessor.normalize(&direction.direction_keyword).is_empty() {
            return Err(AppError::Validation(format!(
                "Direction keyword '{}' is empty after normalization",
                direction.direction_keyword
            )));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(keyword = %direction.direction_keyword))]
    async fn run_direction(
        &self,
        corpus: &Corpus,
        stage_a: &StageAResult,
        normalized: &[NormalizedPhrase],
        assignment: &HashMap<PhraseId, &ClusterId>,
        direction: &Direction,
        generation: Uuid,
    ) -> Result<DirectionResult, AppError> {
        let keyword = self.preprocessor.normalize(&direction.direction_keyword);
        let source_members = stage_a
            .cluster(&direction.source_cluster_id)
            .map(|c| &c.member_phrase_ids)
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "Unknown Stage-A cluster {}",
                    direction.source_cluster_id
                ))
            })?;

        let mut keyword_matches = 0;
        let subset: Vec<NormalizedPhrase> = normalized
            .iter()
            .filter(|p| {
                if source_members.contains(&p.phrase_id) {
                    true
                } else if direction.match_keyword && contains_keyword(&p.text, &keyword) {
                    keyword_matches += 1;
                    true
                } else {
                    false
                }
            })
            .cloned()
            .collect();

        let mut report = StageReport::new(Stage::B, &self.round_id, generation, subset.len());
        report.direction_keyword = Some(direction.direction_keyword.clone());

        let embedded = self.embed(&subset).await?;
        report.cache = embedded.stats;
        report.record_exclusions(&embedded.excluded);

        let (clusters, params) = if embedded.groups.is_empty() {
            report.warn("No phrases left to cluster");
            (Vec::new(), None)
        } else {
            let params = self.fine.select(embedded.groups.len());
            let (outcome, members) = self.cluster_blocking(embedded.groups, params).await?;
            report.record_outcome(&outcome);
            (build_clusters(Stage::B, outcome.n_clusters, members), Some(params))
        };
        report.record_clusters(&clusters);

        let mut rows: Vec<StageBRow> = clusters
            .iter()
            .flat_map(|cluster| {
                cluster.member_phrase_ids.iter().map(|&phrase_id| StageBRow {
                    phrase_id,
                    cluster_id_a: assignment.get(&phrase_id).map(|id| (*id).clone()),
                    cluster_id_b: cluster.cluster_id.clone(),
                    direction_keyword: direction.direction_keyword.clone(),
                })
            })
            .collect();
        rows.sort_by_key(|row| row.phrase_id);

        let summaries = self.summarizer.summarize_all(
            &clusters,
            corpus.phrases(),
            Some(&direction.direction_keyword),
        )?;

        info!(
            members = subset.len(),
            keyword_matches,
            clusters = report.cluster_count,
            noise = report.noise_phrases,
            "Direction clustered"
        );
        Ok(DirectionResult {
            direction: direction.clone(),
            params,
            keyword_matches,
            clusters,
            summaries,
            rows,
            report,
        })
    }
}
