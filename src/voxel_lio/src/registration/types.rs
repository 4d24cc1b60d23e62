//! Type definitions for scan registration.

use nalgebra::{Isometry3, Matrix6};
use serde::Deserialize;

use super::correspondence::CorrespondencePolicy;

/// Residual model used by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualKind {
    /// Full 3D offset to the target.
    #[default]
    PointToPoint,
    /// Offset projected onto the target cell normal. Targets without a normal
    /// fall back to point-to-point.
    PointToPlane,
}

/// Configuration for scan-to-map registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Maximum number of Gauss-Newton iterations.
    pub max_iterations: usize,

    /// Convergence threshold on the rotation update norm (rad).
    pub rotation_epsilon: f64,

    /// Convergence threshold on the translation update norm (m).
    pub translation_epsilon: f64,

    /// Correspondences farther than this are outliers (m).
    pub max_correspondence_distance: f64,

    /// Neighborhood radius in cells for correspondence search.
    pub neighborhood_radius: u32,

    /// Residual model.
    pub residual_kind: ResidualKind,

    /// Centroid or raw-point targets.
    pub correspondence_policy: CorrespondencePolicy,

    /// Fewer inliers than this aborts the run as diverged.
    pub min_correspondences: usize,

    /// Consecutive residual increases tolerated before declaring divergence.
    pub max_divergent_iterations: usize,

    /// Normal equations with `max_eig / min_eig` above this are singular.
    pub max_condition_number: f64,

    /// Points per parallel work unit.
    ///
    /// Partial sums are reduced in chunk order, so a fixed chunk size makes
    /// results independent of the thread count.
    pub chunk_size: usize,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            rotation_epsilon: 1e-5,
            translation_epsilon: 1e-4,
            max_correspondence_distance: 1.0,
            neighborhood_radius: 1,
            residual_kind: ResidualKind::PointToPoint,
            correspondence_policy: CorrespondencePolicy::Centroid,
            min_correspondences: 10,
            max_divergent_iterations: 3,
            max_condition_number: 1e12,
            chunk_size: 256,
        }
    }
}

/// Why a run was declared diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceReason {
    /// Residual RMS kept increasing.
    ResidualIncreasing,
    /// Normal equations were singular or ill-conditioned.
    SingularSystem,
    /// Too few points found a correspondence.
    InsufficientCorrespondences,
}

/// Terminal state of a registration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// Update norms fell below both epsilons.
    Converged,
    /// Iteration cap reached first.
    MaxIterationsReached,
    /// The run was abandoned.
    Diverged(DivergenceReason),
}

impl RegistrationStatus {
    /// Check if the run converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, RegistrationStatus::Converged)
    }

    /// Check if the result is usable (converged or max iterations).
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            RegistrationStatus::Converged | RegistrationStatus::MaxIterationsReached
        )
    }
}

/// Result of aligning one scan against the map.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    /// Final estimate mapping scan coordinates into map coordinates.
    pub transform: Isometry3<f64>,

    /// Terminal state.
    pub status: RegistrationStatus,

    /// Number of updates applied.
    pub iterations: usize,

    /// Points with a correspondence at the final estimate.
    pub inliers: usize,

    /// Points without a correspondence at the final estimate.
    pub outliers: usize,

    /// Residual RMS at the final estimate.
    pub residual_rms: f64,

    /// Pose covariance over `[dt, dtheta]`, `sigma^2 (J^T J)^-1`.
    ///
    /// Infinite on the diagonal when the system is not invertible.
    pub covariance: Matrix6<f64>,

    /// Information matrix `J^T J / sigma^2`.
    pub information: Matrix6<f64>,
}
