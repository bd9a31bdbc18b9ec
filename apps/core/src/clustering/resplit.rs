use super::engine::{ClusterOutcome, ClusteringEngine, EmbeddedGroup};
use super::params::{ClusterParams, ParameterSelector, SelectorProfile};
use crate::error::AppError;
use crate::models::{Cluster, ClusterId, PhraseId, Stage, NOISE_LABEL};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

pub const DEFAULT_RESPLIT_THRESHOLD: usize = 1_000;

/// Sub-clusters of one resplit parent.
#[derive(Debug, Clone, Serialize)]
pub struct ResplitResult {
    pub parent: ClusterId,
    /// Sub-clusters `parent.0..k`, then `parent.-1` when anything was left over.
    pub clusters: Vec<Cluster>,
    pub outcome: ClusterOutcome,
}

impl ResplitResult {
    pub fn noise(&self) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.is_noise)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResplitOutcome {
    /// At or under the threshold; returned untouched.
    NotApplied { cluster: Cluster },
    Split(ResplitResult),
}

/// Re-clusters a single oversized cluster with the finer resplit profile.
/// One level only: sub-clusters are never resplit again here.
#[derive(Debug, Clone)]
pub struct Resplitter {
    engine: ClusteringEngine,
    selector: ParameterSelector,
    size_threshold: usize,
}

impl Resplitter {
    pub fn new(engine: ClusteringEngine, selector: ParameterSelector, size_threshold: usize) -> Self {
        Self {
            engine,
            selector,
            size_threshold,
        }
    }

    pub fn with_defaults(engine: ClusteringEngine) -> Result<Self, AppError> {
        Ok(Self::new(
            engine,
            ParameterSelector::new(SelectorProfile::resplit())?,
            DEFAULT_RESPLIT_THRESHOLD,
        ))
    }

    pub fn size_threshold(&self) -> usize {
        self.size_threshold
    }

    pub fn applies_to(&self, cluster: &Cluster) -> bool {
        !cluster.is_noise && cluster.size() > self.size_threshold
    }

    pub fn params_for(&self, points: usize) -> ClusterParams {
        self.selector.select(points)
    }

    /// `groups` carries the embedded members of `cluster`. Members with no group
    /// land in the resplit noise so the parent's member set is preserved.
    pub fn resplit(
        &self,
        cluster: &Cluster,
        groups: &[EmbeddedGroup],
    ) -> Result<ResplitOutcome, AppError> {
        if cluster.is_noise {
            return Err(AppError::Validation(format!(
                "Cluster {} is noise and cannot be resplit",
                cluster.cluster_id
            )));
        }
        if cluster.size() <= self.size_threshold {
            return Ok(ResplitOutcome::NotApplied {
                cluster: cluster.clone(),
            });
        }

        let mut covered = BTreeSet::new();
        for id in groups.iter().flat_map(|g| g.phrase_ids.iter()) {
            if !cluster.member_phrase_ids.contains(id) {
                return Err(AppError::Validation(format!(
                    "Phrase {} is not a member of cluster {}",
                    id, cluster.cluster_id
                )));
            }
            covered.insert(*id);
        }
        if groups.is_empty() {
            return Err(AppError::InsufficientData(format!(
                "Cluster {} has no embedded members",
                cluster.cluster_id
            )));
        }

        let params = self.selector.select(groups.len());
        let (outcome, mut members) = self.engine.cluster_groups(groups, &params)?;

        let uncovered: Vec<PhraseId> = cluster
            .member_phrase_ids
            .difference(&covered)
            .copied()
            .collect();
        if !uncovered.is_empty() {
            warn!(
                cluster = %cluster.cluster_id,
                count = uncovered.len(),
                "Members without vectors moved to resplit noise"
            );
            members.entry(NOISE_LABEL).or_default().extend(uncovered);
        }

        let mut clusters: Vec<Cluster> = (0..outcome.n_clusters as i32)
            .filter_map(|label| {
                members.remove(&label).map(|ids| {
                    Cluster::new(cluster.cluster_id.child(label), Stage::Resplit, ids)
                })
            })
            .collect();
        if let Some(noise) = members.remove(&NOISE_LABEL) {
            clusters.push(Cluster::new(
                cluster.cluster_id.child(NOISE_LABEL),
                Stage::Resplit,
                noise,
            ));
        }

        info!(
            parent = %cluster.cluster_id,
            size = cluster.size(),
            sub_clusters = outcome.n_clusters,
            "Resplit complete"
        );
        Ok(ResplitOutcome::Split(ResplitResult {
            parent: cluster.cluster_id.clone(),
            clusters,
            outcome,
        }))
    }
}
