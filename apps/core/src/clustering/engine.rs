use super::algorithm::{ClusterAlgorithm, Hdbscan};
use super::params::ClusterParams;
use crate::error::AppError;
use crate::models::{PhraseId, NOISE_LABEL};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Silhouette is O(n²); skipped above this many points unless configured otherwise.
pub const DEFAULT_SILHOUETTE_MAX_POINTS: usize = 5_000;

/// Something noteworthy about a clustering run that did not stop it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusteringDiagnostic {
    /// Fewer points than `min_cluster_size`; everything is noise.
    InsufficientData { points: usize, min_cluster_size: usize },
    /// Vectors with zero length; they stay at the origin after normalization.
    ZeroNormVectors { count: usize },
    /// The algorithm could not produce clusters; everything is noise.
    ClusteringFailure { message: String },
}

/// Labels plus everything learned while producing them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterOutcome {
    /// One label per input vector: `0..n_clusters` or `-1`.
    pub labels: Vec<i32>,
    pub n_clusters: usize,
    pub noise_count: usize,
    pub params: ClusterParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silhouette: Option<f64>,
    #[serde(default)]
    pub diagnostics: Vec<ClusteringDiagnostic>,
}

impl ClusterOutcome {
    fn all_noise(n: usize, params: ClusterParams, diagnostics: Vec<ClusteringDiagnostic>) -> Self {
        Self {
            labels: vec![NOISE_LABEL; n],
            n_clusters: 0,
            noise_count: n,
            params,
            silhouette: None,
            diagnostics,
        }
    }

    /// Member count per label `0..n_clusters`.
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for &label in &self.labels {
            if label >= 0 {
                sizes[label as usize] += 1;
            }
        }
        sizes
    }

    /// True when the run fell back to all-noise.
    pub fn is_degraded(&self) -> bool {
        self.diagnostics.iter().any(|d| {
            matches!(
                d,
                ClusteringDiagnostic::InsufficientData { .. }
                    | ClusteringDiagnostic::ClusteringFailure { .. }
            )
        })
    }
}

/// Phrases that share one normalized text and therefore one vector.
#[derive(Debug, Clone)]
pub struct EmbeddedGroup {
    pub phrase_ids: Vec<PhraseId>,
    pub vector: Arc<[f32]>,
}

/// Runs the clustering primitive with input checks, normalization and the
/// all-noise fallbacks. Cheap to clone; meant for `spawn_blocking`.
#[derive(Clone)]
pub struct ClusteringEngine {
    algorithm: Arc<dyn ClusterAlgorithm>,
    silhouette_max_points: usize,
}

impl Default for ClusteringEngine {
    fn default() -> Self {
        Self::new(Arc::new(Hdbscan), DEFAULT_SILHOUETTE_MAX_POINTS)
    }
}

impl std::fmt::Debug for ClusteringEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteringEngine")
            .field("algorithm", &self.algorithm.name())
            .field("silhouette_max_points", &self.silhouette_max_points)
            .finish()
    }
}

impl ClusteringEngine {
    pub fn new(algorithm: Arc<dyn ClusterAlgorithm>, silhouette_max_points: usize) -> Self {
        Self {
            algorithm,
            silhouette_max_points,
        }
    }

    pub fn cluster<V: AsRef<[f32]>>(
        &self,
        vectors: &[V],
        params: &ClusterParams,
    ) -> Result<ClusterOutcome, AppError> {
        let n = vectors.len();
        if n == 0 {
            return Err(AppError::Validation("No vectors to cluster".to_string()));
        }
        let dimension = vectors[0].as_ref().len();
        if dimension == 0 {
            return Err(AppError::Validation("Vectors have zero dimension".to_string()));
        }
        if let Some(index) = vectors.iter().position(|v| v.as_ref().len() != dimension) {
            return Err(AppError::Validation(format!(
                "Vector {} has dimension {}, expected {}",
                index,
                vectors[index].as_ref().len(),
                dimension
            )));
        }
        if let Some(index) = vectors
            .iter()
            .position(|v| v.as_ref().iter().any(|x| !x.is_finite()))
        {
            return Err(AppError::Validation(format!(
                "Vector {} contains non-finite values",
                index
            )));
        }
        params.validate()?;

        if n < params.min_cluster_size {
            warn!(
                points = n,
                min_cluster_size = params.min_cluster_size,
                "Too few points to form a cluster, labelling all as noise"
            );
            return Ok(ClusterOutcome::all_noise(
                n,
                *params,
                vec![ClusteringDiagnostic::InsufficientData {
                    points: n,
                    min_cluster_size: params.min_cluster_size,
                }],
            ));
        }

        let mut diagnostics = Vec::new();
        let (normalized, zero_norm) = l2_normalize(vectors);
        if zero_norm > 0 {
            warn!(count = zero_norm, "Zero-norm vectors in clustering input");
            diagnostics.push(ClusteringDiagnostic::ZeroNormVectors { count: zero_norm });
        }

        if normalized.iter().all(|v| v == &normalized[0]) {
            warn!(points = n, "All vectors identical, no density structure to cluster");
            diagnostics.push(ClusteringDiagnostic::ClusteringFailure {
                message: "All input vectors are identical".to_string(),
            });
            return Ok(ClusterOutcome::all_noise(n, *params, diagnostics));
        }

        let raw = match self.algorithm.fit(&normalized, params) {
            Ok(labels) if labels.len() == n => labels,
            Ok(labels) => {
                let message = format!(
                    "{} returned {} labels for {} points",
                    self.algorithm.name(),
                    labels.len(),
                    n
                );
                warn!("{}", message);
                diagnostics.push(ClusteringDiagnostic::ClusteringFailure { message });
                return Ok(ClusterOutcome::all_noise(n, *params, diagnostics));
            }
            Err(e) => {
                warn!(error = %e, "Clustering algorithm failed, labelling all as noise");
                diagnostics.push(ClusteringDiagnostic::ClusteringFailure {
                    message: e.to_string(),
                });
                return Ok(ClusterOutcome::all_noise(n, *params, diagnostics));
            }
        };

        let (labels, n_clusters) = relabel_dense(&raw);
        let noise_count = labels.iter().filter(|&&l| l == NOISE_LABEL).count();
        let silhouette = if n_clusters >= 2 && n <= self.silhouette_max_points {
            Some(silhouette_score(&normalized, &labels))
        } else {
            None
        };

        debug!(
            algorithm = self.algorithm.name(),
            min_cluster_size = params.min_cluster_size,
            min_samples = params.min_samples,
            "Clustering parameters"
        );
        info!(
            points = n,
            clusters = n_clusters,
            noise = noise_count,
            silhouette = ?silhouette,
            "Clustering complete"
        );

        Ok(ClusterOutcome {
            labels,
            n_clusters,
            noise_count,
            params: *params,
            silhouette,
            diagnostics,
        })
    }

    /// Clusters one point per group and hands every phrase of a group the
    /// group's label. Returns the outcome and the members of each label.
    pub fn cluster_groups(
        &self,
        groups: &[EmbeddedGroup],
        params: &ClusterParams,
    ) -> Result<(ClusterOutcome, BTreeMap<i32, BTreeSet<PhraseId>>), AppError> {
        let vectors: Vec<&[f32]> = groups.iter().map(|g| g.vector.as_ref()).collect();
        let outcome = self.cluster(&vectors, params)?;
        let mut members: BTreeMap<i32, BTreeSet<PhraseId>> = BTreeMap::new();
        for (group, &label) in groups.iter().zip(&outcome.labels) {
            members
                .entry(label)
                .or_default()
                .extend(group.phrase_ids.iter().copied());
        }
        Ok((outcome, members))
    }
}

fn l2_normalize<V: AsRef<[f32]>>(vectors: &[V]) -> (Vec<Vec<f32>>, usize) {
    let mut zero_norm = 0;
    let normalized = vectors
        .iter()
        .map(|v| {
            let v = v.as_ref();
            let norm = v.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt();
            if norm > 0.0 {
                v.iter().map(|x| (f64::from(*x) / norm) as f32).collect()
            } else {
                zero_norm += 1;
                v.to_vec()
            }
        })
        .collect();
    (normalized, zero_norm)
}

/// Renumbers labels `0..k` in order of first appearance; noise stays `-1`.
pub fn relabel_dense(raw: &[i32]) -> (Vec<i32>, usize) {
    let mut mapping: HashMap<i32, i32> = HashMap::new();
    let labels = raw
        .iter()
        .map(|&label| {
            if label < 0 {
                return NOISE_LABEL;
            }
            let next = mapping.len() as i32;
            *mapping.entry(label).or_insert(next)
        })
        .collect();
    (labels, mapping.len())
}

fn distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Mean silhouette over non-noise points; singleton clusters score 0.
fn silhouette_score(vectors: &[Vec<f32>], labels: &[i32]) -> f64 {
    let n_clusters = labels.iter().filter(|&&l| l >= 0).map(|&l| l as usize + 1).max().unwrap_or(0);
    if n_clusters < 2 {
        return 0.0;
    }
    let mut sizes = vec![0usize; n_clusters];
    for &l in labels.iter().filter(|&&l| l >= 0) {
        sizes[l as usize] += 1;
    }

    let mut total = 0.0;
    let mut counted = 0usize;
    let mut sums = vec![0.0f64; n_clusters];
    for (i, &own) in labels.iter().enumerate() {
        if own < 0 {
            continue;
        }
        let own = own as usize;
        counted += 1;
        if sizes[own] < 2 {
            continue;
        }
        sums.iter_mut().for_each(|s| *s = 0.0);
        for (j, &other) in labels.iter().enumerate() {
            if other >= 0 && i != j {
                sums[other as usize] += distance(&vectors[i], &vectors[j]);
            }
        }
        let a = sums[own] / (sizes[own] - 1) as f64;
        let b = (0..n_clusters)
            .filter(|&c| c != own && sizes[c] > 0)
            .map(|c| sums[c] / sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > 0.0 && denom.is_finite() {
            total += (b - a) / denom;
        }
    }
    if counted == 0 {
        0.0
    } else {
        total / counted as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingAlgorithm;

    impl ClusterAlgorithm for FailingAlgorithm {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn fit(&self, _: &[Vec<f32>], _: &ClusterParams) -> Result<Vec<i32>, AppError> {
            Err(AppError::ClusteringFailure("boom".to_string()))
        }
    }

    struct FixedLabels(Vec<i32>);

    impl ClusterAlgorithm for FixedLabels {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn fit(&self, _: &[Vec<f32>], _: &ClusterParams) -> Result<Vec<i32>, AppError> {
            Ok(self.0.clone())
        }
    }

    fn spread(n: usize) -> Vec<Vec<f32>> {
        (0..n).map(|i| vec![1.0, i as f32]).collect()
    }

    #[test]
    fn test_relabel_dense_follows_first_appearance() {
        let (labels, k) = relabel_dense(&[7, -1, 3, 7, 12, 3, -1]);
        assert_eq!(labels, vec![0, -1, 1, 0, 2, 1, -1]);
        assert_eq!(k, 3);
    }

    #[test]
    fn test_rejects_empty_and_ragged_input() {
        let engine = ClusteringEngine::default();
        let params = ClusterParams::new(2, 1);
        let empty: Vec<Vec<f32>> = Vec::new();
        assert!(matches!(engine.cluster(&empty, &params), Err(AppError::Validation(_))));

        let ragged = vec![vec![1.0, 0.0], vec![1.0]];
        assert!(matches!(engine.cluster(&ragged, &params), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_below_min_cluster_size_is_all_noise() {
        let engine = ClusteringEngine::default();
        let outcome = engine.cluster(&spread(3), &ClusterParams::new(5, 2)).unwrap();
        assert_eq!(outcome.labels, vec![-1, -1, -1]);
        assert_eq!(outcome.noise_count, 3);
        assert!(outcome.is_degraded());
    }

    #[test]
    fn test_identical_vectors_degrade_to_noise() {
        let engine = ClusteringEngine::default();
        let points = vec![vec![0.5, 0.5]; 10];
        let outcome = engine.cluster(&points, &ClusterParams::new(2, 1)).unwrap();
        assert_eq!(outcome.n_clusters, 0);
        assert!(matches!(
            outcome.diagnostics.as_slice(),
            [ClusteringDiagnostic::ClusteringFailure { .. }]
        ));
    }

    #[test]
    fn test_algorithm_error_degrades_to_noise() {
        let engine = ClusteringEngine::new(Arc::new(FailingAlgorithm), 100);
        let outcome = engine.cluster(&spread(6), &ClusterParams::new(2, 1)).unwrap();
        assert_eq!(outcome.noise_count, 6);
        assert!(outcome.is_degraded());
    }

    #[test]
    fn test_zero_norm_vectors_are_reported() {
        let engine = ClusteringEngine::new(Arc::new(FixedLabels(vec![0, 0, 1, 1])), 100);
        let points = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 2.0]];
        let outcome = engine.cluster(&points, &ClusterParams::new(2, 1)).unwrap();
        assert!(outcome
            .diagnostics
            .contains(&ClusteringDiagnostic::ZeroNormVectors { count: 1 }));
        assert_eq!(outcome.cluster_sizes(), vec![2, 2]);
    }

    #[test]
    fn test_silhouette_for_well_separated_groups() {
        let engine = ClusteringEngine::new(Arc::new(FixedLabels(vec![0, 0, 1, 1])), 100);
        let points = vec![vec![1.0, 0.0], vec![1.0, 0.01], vec![0.0, 1.0], vec![0.01, 1.0]];
        let outcome = engine.cluster(&points, &ClusterParams::new(2, 1)).unwrap();
        let score = outcome.silhouette.unwrap();
        assert!(score > 0.9, "silhouette {}", score);
    }

    #[test]
    fn test_silhouette_skipped_above_cap() {
        let engine = ClusteringEngine::new(Arc::new(FixedLabels(vec![0, 0, 1, 1])), 3);
        let points = vec![vec![1.0, 0.0], vec![1.0, 0.01], vec![0.0, 1.0], vec![0.01, 1.0]];
        let outcome = engine.cluster(&points, &ClusterParams::new(2, 1)).unwrap();
        assert_eq!(outcome.silhouette, None);
    }

    #[test]
    fn test_cluster_groups_broadcasts_labels() {
        let engine = ClusteringEngine::new(Arc::new(FixedLabels(vec![0, -1, 0])), 100);
        let groups = vec![
            EmbeddedGroup { phrase_ids: vec![1, 4], vector: Arc::from(vec![1.0f32, 0.0]) },
            EmbeddedGroup { phrase_ids: vec![2], vector: Arc::from(vec![0.0f32, 1.0]) },
            EmbeddedGroup { phrase_ids: vec![3], vector: Arc::from(vec![1.0f32, 0.1]) },
        ];
        let (outcome, members) = engine.cluster_groups(&groups, &ClusterParams::new(2, 1)).unwrap();
        assert_eq!(outcome.n_clusters, 1);
        assert_eq!(members[&0], BTreeSet::from([1, 3, 4]));
        assert_eq!(members[&-1], BTreeSet::from([2]));
    }
}
