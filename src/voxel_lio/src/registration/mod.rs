//! Gauss-Newton scan-to-map registration.
//!
//! This module implements the alignment loop:
//! 1. Transform scan points using the current estimate
//! 2. Find correspondences in the voxel map
//! 3. Solve the normal equations: (J^T J) d = -J^T r
//! 4. Update the estimate and check convergence
//!
//! Residuals are point-to-point or point-to-plane; targets are cell centroids
//! or raw points.

pub mod correspondence;
pub mod newton;
pub mod solver;
pub mod types;

pub use correspondence::{Correspondence, CorrespondencePolicy, CorrespondenceSearch};
pub use newton::{condition_number, gauss_newton_step};
pub use solver::RegistrationSolver;
pub use types::{
    DivergenceReason, RegistrationConfig, RegistrationResult, RegistrationStatus, ResidualKind,
};
