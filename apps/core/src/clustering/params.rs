//! Clustering hyperparameters and the size-adaptive selector.
//!
//! `min_cluster_size = clamp(round(scale * sqrt(n)), floor, ceiling)`
//! `min_samples      = min(clamp(round(log10(n)), floor, ceiling), min_cluster_size)`
//!
//! Both grow monotonically with `n` and stay inside their bounds.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// How clusters are extracted from the condensed hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Excess of Mass: the most persistent clusters.
    #[default]
    Eom,
    /// Leaf clusters only: finer-grained.
    Leaf,
}

/// Parameters for one clustering invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterParams {
    /// Smallest group reported as a cluster.
    pub min_cluster_size: usize,
    /// Neighbourhood size for core distances.
    pub min_samples: usize,
    pub selection_method: SelectionMethod,
}

impl ClusterParams {
    pub fn new(min_cluster_size: usize, min_samples: usize) -> Self {
        Self {
            min_cluster_size,
            min_samples,
            selection_method: SelectionMethod::Eom,
        }
    }

    #[must_use]
    pub fn with_selection_method(mut self, method: SelectionMethod) -> Self {
        self.selection_method = method;
        self
    }

    /// Rejects `min_cluster_size < 2`, `min_samples < 1` and `min_samples > min_cluster_size`.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.min_cluster_size < 2 {
            return Err(AppError::Validation(format!(
                "min_cluster_size must be >= 2, got {}",
                self.min_cluster_size
            )));
        }
        if self.min_samples < 1 {
            return Err(AppError::Validation("min_samples must be >= 1".to_string()));
        }
        if self.min_samples > self.min_cluster_size {
            return Err(AppError::Validation(format!(
                "min_samples ({}) must not exceed min_cluster_size ({})",
                self.min_samples, self.min_cluster_size
            )));
        }
        Ok(())
    }
}

/// Coefficients and bounds for one granularity level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct SelectorProfile {
    #[validate(range(min = 0.0, max = 10.0))]
    pub scale: f64,
    #[validate(range(min = 2))]
    pub min_cluster_size_floor: usize,
    #[validate(range(min = 2))]
    pub min_cluster_size_ceiling: usize,
    #[validate(range(min = 1))]
    pub min_samples_floor: usize,
    #[validate(range(min = 1))]
    pub min_samples_ceiling: usize,
    pub selection_method: SelectionMethod,
}

impl SelectorProfile {
    /// Whole-corpus pass: tens to low hundreds of clusters.
    pub fn coarse() -> Self {
        Self {
            scale: 0.13,
            min_cluster_size_floor: 8,
            min_cluster_size_ceiling: 120,
            min_samples_floor: 2,
            min_samples_ceiling: 8,
            selection_method: SelectionMethod::Eom,
        }
    }

    /// Per-direction pass.
    pub fn fine() -> Self {
        Self {
            scale: 0.08,
            min_cluster_size_floor: 4,
            min_cluster_size_ceiling: 40,
            min_samples_floor: 1,
            min_samples_ceiling: 5,
            selection_method: SelectionMethod::Eom,
        }
    }

    /// Splitting one oversized cluster.
    pub fn resplit() -> Self {
        Self {
            selection_method: SelectionMethod::Leaf,
            ..Self::fine()
        }
    }

    /// Field ranges plus the cross-field bounds the derive cannot express.
    pub fn check(&self) -> Result<(), AppError> {
        self.validate()?;
        if self.min_cluster_size_floor > self.min_cluster_size_ceiling {
            return Err(AppError::Validation(format!(
                "min_cluster_size floor {} exceeds ceiling {}",
                self.min_cluster_size_floor, self.min_cluster_size_ceiling
            )));
        }
        if self.min_samples_floor > self.min_samples_ceiling {
            return Err(AppError::Validation(format!(
                "min_samples floor {} exceeds ceiling {}",
                self.min_samples_floor, self.min_samples_ceiling
            )));
        }
        if !self.scale.is_finite() {
            return Err(AppError::Validation("scale must be finite".to_string()));
        }
        Ok(())
    }
}

/// Derives clustering parameters from the number of phrases being clustered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterSelector {
    profile: SelectorProfile,
}

impl ParameterSelector {
    pub fn new(profile: SelectorProfile) -> Result<Self, AppError> {
        profile.check()?;
        Ok(Self { profile })
    }

    pub fn profile(&self) -> &SelectorProfile {
        &self.profile
    }

    pub fn select(&self, n_phrases: usize) -> ClusterParams {
        let p = &self.profile;
        let n = n_phrases.max(1) as f64;

        let scaled_size = (p.scale * n.sqrt()).round() as usize;
        let min_cluster_size =
            scaled_size.clamp(p.min_cluster_size_floor, p.min_cluster_size_ceiling);

        let scaled_samples = n.log10().round() as usize;
        let min_samples = scaled_samples
            .clamp(p.min_samples_floor, p.min_samples_ceiling)
            .min(min_cluster_size);

        ClusterParams::new(min_cluster_size, min_samples)
            .with_selection_method(p.selection_method)
    }
}
