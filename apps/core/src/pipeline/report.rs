use crate::actors::messages::CacheStats;
use crate::clustering::{ClusterOutcome, ClusterParams, ClusteringDiagnostic};
use crate::models::{Cluster, PhraseId, Stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Why a phrase took no part in clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    LengthOutOfBounds,
    EmptyAfterNormalization,
    EmbeddingFailed,
    CacheCorrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedPhrase {
    pub phrase_id: PhraseId,
    pub reason: ExclusionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Counts and warnings for one stage run.
///
/// `input_phrases == Σ excluded_phrases + clustered_phrases` and
/// `clustered_phrases` counts noise members too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub round_id: String,
    pub generation: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction_keyword: Option<String>,
    pub input_phrases: usize,
    pub excluded_phrases: BTreeMap<ExclusionReason, usize>,
    pub clustered_phrases: usize,
    pub noise_phrases: usize,
    pub cluster_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ClusterParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silhouette: Option<f64>,
    #[serde(default)]
    pub diagnostics: Vec<ClusteringDiagnostic>,
    #[serde(default)]
    pub cache: CacheStats,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl StageReport {
    pub fn new(stage: Stage, round_id: &str, generation: Uuid, input_phrases: usize) -> Self {
        Self {
            stage,
            round_id: round_id.to_string(),
            generation,
            direction_keyword: None,
            input_phrases,
            excluded_phrases: BTreeMap::new(),
            clustered_phrases: 0,
            noise_phrases: 0,
            cluster_count: 0,
            params: None,
            silhouette: None,
            diagnostics: Vec::new(),
            cache: CacheStats::default(),
            warnings: Vec::new(),
        }
    }

    pub fn record_exclusions(&mut self, excluded: &[ExcludedPhrase]) {
        for phrase in excluded {
            *self.excluded_phrases.entry(phrase.reason).or_insert(0) += 1;
        }
    }

    pub fn record_clusters(&mut self, clusters: &[Cluster]) {
        self.clustered_phrases = clusters.iter().map(Cluster::size).sum();
        self.noise_phrases = clusters.iter().filter(|c| c.is_noise).map(Cluster::size).sum();
        self.cluster_count = clusters.iter().filter(|c| !c.is_noise).count();
    }

    /// Copies parameters and diagnostics; degradations become warnings.
    pub fn record_outcome(&mut self, outcome: &ClusterOutcome) {
        self.params = Some(outcome.params);
        self.silhouette = outcome.silhouette;
        for diagnostic in &outcome.diagnostics {
            match diagnostic {
                ClusteringDiagnostic::InsufficientData { points, min_cluster_size } => {
                    self.warn(format!(
                        "Insufficient data: {} points below min_cluster_size {}, all noise",
                        points, min_cluster_size
                    ));
                }
                ClusteringDiagnostic::ClusteringFailure { message } => {
                    self.warn(format!("Clustering failed, all noise: {}", message));
                }
                ClusteringDiagnostic::ZeroNormVectors { count } => {
                    self.warn(format!("{} zero-norm vectors", count));
                }
            }
        }
        self.diagnostics = outcome.diagnostics.clone();
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn excluded_total(&self) -> usize {
        self.excluded_phrases.values().sum()
    }

    pub fn is_balanced(&self) -> bool {
        self.input_phrases == self.excluded_total() + self.clustered_phrases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClusterId;
    use std::collections::BTreeSet;

    #[test]
    fn test_counts_balance() {
        let mut report = StageReport::new(Stage::A, "r1", Uuid::new_v4(), 6);
        report.record_exclusions(&[
            ExcludedPhrase { phrase_id: 4, reason: ExclusionReason::EmptyAfterNormalization, detail: None },
            ExcludedPhrase { phrase_id: 5, reason: ExclusionReason::EmbeddingFailed, detail: Some("timeout".into()) },
        ]);
        report.record_clusters(&[
            Cluster::new(ClusterId::from_label(0), Stage::A, BTreeSet::from([0, 1])),
            Cluster::new(ClusterId::noise(), Stage::A, BTreeSet::from([2, 3])),
        ]);

        assert_eq!(report.excluded_total(), 2);
        assert_eq!(report.clustered_phrases, 4);
        assert_eq!(report.noise_phrases, 2);
        assert_eq!(report.cluster_count, 1);
        assert!(report.is_balanced());
    }
}
