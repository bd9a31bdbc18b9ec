//! Density-based clustering primitive.
//!
//! `ClusterAlgorithm` is the seam the engine calls through. `Hdbscan` adapts the
//! `hdbscan` crate to it: parameters pass straight through and the crate's labels
//! come back unchanged, `-1` for noise.

use super::params::{ClusterParams, SelectionMethod};
use crate::error::AppError;
use hdbscan::{
    ClusterSelectionMethod, DistanceMetric, Hdbscan as HdbscanClusterer, HdbscanHyperParams,
    NnAlgorithm,
};
use tracing::debug;

/// Assigns a label to every input vector: a non-negative cluster label or
/// [`crate::models::NOISE_LABEL`]. Label values carry no meaning beyond grouping.
pub trait ClusterAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    fn fit(&self, vectors: &[Vec<f32>], params: &ClusterParams) -> Result<Vec<i32>, AppError>;
}

/// Hierarchical DBSCAN over Euclidean distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hdbscan;

impl Hdbscan {
    fn hyper_params(params: &ClusterParams) -> HdbscanHyperParams {
        let method = match params.selection_method {
            SelectionMethod::Eom => ClusterSelectionMethod::Eom,
            SelectionMethod::Leaf => ClusterSelectionMethod::Leaf,
        };
        HdbscanHyperParams::builder()
            .min_cluster_size(params.min_cluster_size)
            .min_samples(params.min_samples)
            .dist_metric(DistanceMetric::Euclidean)
            .nn_algorithm(NnAlgorithm::Auto)
            .cluster_selection_method(method)
            .allow_single_cluster(false)
            .build()
    }
}

impl ClusterAlgorithm for Hdbscan {
    fn name(&self) -> &'static str {
        "hdbscan"
    }

    fn fit(&self, vectors: &[Vec<f32>], params: &ClusterParams) -> Result<Vec<i32>, AppError> {
        params.validate()?;
        if vectors.iter().flatten().any(|v| !v.is_finite()) {
            return Err(AppError::ClusteringFailure(
                "Input contains non-finite values".to_string(),
            ));
        }

        let labels = HdbscanClusterer::new(vectors, Self::hyper_params(params))
            .cluster()
            .map_err(|e| AppError::ClusteringFailure(format!("HDBSCAN failed: {}", e)))?;

        debug!(
            points = vectors.len(),
            min_cluster_size = params.min_cluster_size,
            min_samples = params.min_samples,
            method = ?params.selection_method,
            "HDBSCAN fit complete"
        );
        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NOISE_LABEL;

    fn blob(center: [f32; 2], count: usize) -> Vec<Vec<f32>> {
        (0..count)
            .map(|i| {
                let dx = (i % 3) as f32 * 0.05 + (i as f32) * 0.001;
                let dy = (i / 3) as f32 * 0.05;
                vec![center[0] + dx, center[1] + dy]
            })
            .collect()
    }

    fn two_blobs() -> Vec<Vec<f32>> {
        let mut points = blob([0.0, 0.0], 8);
        points.extend(blob([10.0, 10.0], 8));
        points
    }

    fn distinct_clusters(labels: &[i32]) -> usize {
        let mut distinct: Vec<i32> = labels.iter().copied().filter(|&l| l >= 0).collect();
        distinct.sort_unstable();
        distinct.dedup();
        distinct.len()
    }

    #[test]
    fn test_separates_two_blobs() {
        let points = two_blobs();
        let labels = Hdbscan.fit(&points, &ClusterParams::new(4, 2)).unwrap();

        assert_eq!(labels.len(), points.len());
        assert!(labels.iter().all(|&l| l != NOISE_LABEL));
        assert!(labels[..8].iter().all(|&l| l == labels[0]));
        assert!(labels[8..].iter().all(|&l| l == labels[8]));
        assert_ne!(labels[0], labels[8]);
    }

    #[test]
    fn test_far_point_is_noise() {
        let mut points = two_blobs();
        points.push(vec![-40.0, 25.0]);
        let labels = Hdbscan.fit(&points, &ClusterParams::new(4, 2)).unwrap();
        assert_eq!(labels[16], NOISE_LABEL);
        assert_ne!(labels[0], NOISE_LABEL);
        assert_ne!(labels[8], NOISE_LABEL);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let points = two_blobs();
        let params = ClusterParams::new(3, 2);
        let first = Hdbscan.fit(&points, &params).unwrap();
        for _ in 0..3 {
            assert_eq!(Hdbscan.fit(&points, &params).unwrap(), first);
        }
    }

    #[test]
    fn test_leaf_selection_is_never_coarser_than_eom() {
        let points = two_blobs();
        let eom = Hdbscan.fit(&points, &ClusterParams::new(3, 1)).unwrap();
        let leaf = Hdbscan
            .fit(
                &points,
                &ClusterParams::new(3, 1).with_selection_method(SelectionMethod::Leaf),
            )
            .unwrap();
        assert!(distinct_clusters(&leaf) >= distinct_clusters(&eom));
    }

    #[test]
    fn test_groups_smaller_than_min_cluster_size_are_noise() {
        let points = two_blobs();
        let labels = Hdbscan.fit(&points, &ClusterParams::new(9, 2)).unwrap();
        assert!(labels.iter().all(|&l| l == NOISE_LABEL));
    }

    #[test]
    fn test_rejects_non_finite_input() {
        let points = vec![vec![0.0, f32::NAN], vec![1.0, 1.0]];
        let err = Hdbscan.fit(&points, &ClusterParams::new(2, 1)).unwrap_err();
        assert!(matches!(err, AppError::ClusteringFailure(_)));
    }

    #[test]
    fn test_rejects_invalid_params() {
        let points = two_blobs();
        let err = Hdbscan.fit(&points, &ClusterParams::new(3, 5)).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
