//! Scan-to-map registration solver.
//!
//! Each iteration:
//! 1. Transform scan points by the current estimate
//! 2. Search a correspondence per point in the voxel map
//! 3. Accumulate `J^T J` and `J^T r` over chunks in parallel
//! 4. Solve the normal equations for `[dt, dtheta]`
//! 5. Apply the update on the left and check convergence
//!
//! The update is a left perturbation `T <- Exp(dtheta, dt) * T`. For a
//! transformed point `p = T q` the point-to-point Jacobian is `[I, -[p]x]`;
//! point-to-plane projects it onto the target normal.

use nalgebra::{
    Isometry3, Matrix3, Matrix3x6, Matrix6, Point3, Translation3, UnitQuaternion, Vector3,
    Vector6,
};
use rayon::prelude::*;
use tracing::{debug, trace};

use super::correspondence::{Correspondence, CorrespondenceSearch};
use super::newton::{gauss_newton_step, spd_inverse};
use super::types::{
    DivergenceReason, RegistrationConfig, RegistrationResult, RegistrationStatus, ResidualKind,
};
use crate::cancel::CancelToken;
use crate::error::{LioError, Result};
use crate::geometry::skew;
use crate::voxel_map::VoxelMap;

/// Normal-equation sums for one chunk (or the whole scan).
#[derive(Debug, Clone)]
struct Accumulator {
    hessian: Matrix6<f64>,
    gradient: Vector6<f64>,
    sum_sq: f64,
    rows: usize,
    inliers: usize,
    outliers: usize,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self {
            hessian: Matrix6::zeros(),
            gradient: Vector6::zeros(),
            sum_sq: 0.0,
            rows: 0,
            inliers: 0,
            outliers: 0,
        }
    }
}

impl Accumulator {
    fn merge(mut self, other: &Accumulator) -> Self {
        self.hessian += other.hessian;
        self.gradient += other.gradient;
        self.sum_sq += other.sum_sq;
        self.rows += other.rows;
        self.inliers += other.inliers;
        self.outliers += other.outliers;
        self
    }

    fn add(&mut self, point: &Point3<f64>, correspondence: &Correspondence, kind: ResidualKind) {
        let offset = point - correspondence.target;
        let mut jacobian = Matrix3x6::zeros();
        jacobian
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&Matrix3::identity());
        jacobian
            .fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(-skew(&point.coords)));

        match (kind, correspondence.normal) {
            (ResidualKind::PointToPlane, Some(normal)) => {
                let residual = normal.dot(&offset);
                let row = normal.transpose() * jacobian;
                self.hessian += row.transpose() * row;
                self.gradient += row.transpose() * residual;
                self.sum_sq += residual * residual;
                self.rows += 1;
            }
            _ => {
                self.hessian += jacobian.transpose() * jacobian;
                self.gradient += jacobian.transpose() * offset;
                self.sum_sq += offset.norm_squared();
                self.rows += 3;
            }
        }
        self.inliers += 1;
    }

    fn rms(&self) -> f64 {
        if self.rows == 0 {
            0.0
        } else {
            (self.sum_sq / self.rows as f64).sqrt()
        }
    }

    /// Residual variance with the 6 pose parameters removed from the dof.
    fn sigma_sq(&self) -> f64 {
        let dof = self.rows.saturating_sub(6).max(1) as f64;
        (self.sum_sq / dof).max(1e-12)
    }
}

/// Counts consecutive iterations whose residual RMS went up.
#[derive(Debug, Clone)]
struct DivergenceMonitor {
    limit: usize,
    previous_rms: f64,
    streak: usize,
}

impl DivergenceMonitor {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            previous_rms: f64::INFINITY,
            streak: 0,
        }
    }

    /// Record one iteration. Returns `true` once the RMS has increased
    /// `limit` times in a row; any non-increase resets the streak.
    fn observe(&mut self, rms: f64) -> bool {
        let increased = rms > self.previous_rms * (1.0 + 1e-9);
        self.previous_rms = rms;
        if increased {
            self.streak += 1;
            self.streak >= self.limit
        } else {
            self.streak = 0;
            false
        }
    }
}

/// Gauss-Newton scan-to-map solver.
#[derive(Debug, Clone, Default)]
pub struct RegistrationSolver {
    config: RegistrationConfig,
}

impl RegistrationSolver {
    /// Create a new solver with the given configuration.
    pub fn new(config: RegistrationConfig) -> Self {
        Self { config }
    }

    /// Get the current configuration.
    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Align a scan to the map.
    ///
    /// # Arguments
    /// * `scan` - Points in the scan frame
    /// * `map` - Target map
    /// * `initial_guess` - Starting estimate of the scan-to-map transform
    /// * `cancel` - Polled once per iteration
    ///
    /// # Returns
    /// The result with its terminal status. Non-convergence is reported through
    /// the status, not as an error.
    ///
    /// # Errors
    /// [`LioError::Input`] for an empty scan, [`LioError::Cancelled`] if the
    /// token fires.
    pub fn align(
        &self,
        scan: &[Point3<f64>],
        map: &VoxelMap,
        initial_guess: Isometry3<f64>,
        cancel: &CancelToken,
    ) -> Result<RegistrationResult> {
        if scan.is_empty() {
            return Err(LioError::Input("cannot register an empty scan".to_string()));
        }

        let config = &self.config;
        let search = CorrespondenceSearch::new(
            map,
            config.correspondence_policy,
            config.neighborhood_radius,
            config.max_correspondence_distance,
        )
        .with_normals(config.residual_kind == ResidualKind::PointToPlane);

        let mut transform = initial_guess;
        let mut divergence = DivergenceMonitor::new(config.max_divergent_iterations);
        let mut status = RegistrationStatus::MaxIterationsReached;
        let mut iterations = 0;

        for iteration in 0..config.max_iterations {
            if cancel.is_cancelled() {
                return Err(LioError::Cancelled);
            }

            let acc = self.accumulate(scan, &search, &transform);

            if acc.inliers < config.min_correspondences {
                status = RegistrationStatus::Diverged(DivergenceReason::InsufficientCorrespondences);
                break;
            }

            let rms = acc.rms();
            if divergence.observe(rms) {
                status = RegistrationStatus::Diverged(DivergenceReason::ResidualIncreasing);
                break;
            }

            let Some(step) =
                gauss_newton_step(&acc.hessian, &acc.gradient, config.max_condition_number)
            else {
                status = RegistrationStatus::Diverged(DivergenceReason::SingularSystem);
                break;
            };

            let dt = Vector3::new(step[0], step[1], step[2]);
            let dtheta = Vector3::new(step[3], step[4], step[5]);
            transform = Isometry3::from_parts(
                Translation3::from(dt),
                UnitQuaternion::from_scaled_axis(dtheta),
            ) * transform;
            iterations = iteration + 1;

            trace!(
                iteration,
                rms,
                inliers = acc.inliers,
                step_t = dt.norm(),
                step_r = dtheta.norm(),
                "registration iteration"
            );

            if dtheta.norm() < config.rotation_epsilon && dt.norm() < config.translation_epsilon {
                status = RegistrationStatus::Converged;
                break;
            }
        }

        let final_acc = self.accumulate(scan, &search, &transform);
        let sigma_sq = final_acc.sigma_sq();
        let information = final_acc.hessian / sigma_sq;
        let covariance = spd_inverse(&final_acc.hessian)
            .map(|inv| inv * sigma_sq)
            .unwrap_or_else(|| Matrix6::from_diagonal_element(f64::INFINITY));

        debug!(
            ?status,
            iterations,
            inliers = final_acc.inliers,
            outliers = final_acc.outliers,
            rms = final_acc.rms(),
            "registration finished"
        );

        Ok(RegistrationResult {
            transform,
            status,
            iterations,
            inliers: final_acc.inliers,
            outliers: final_acc.outliers,
            residual_rms: final_acc.rms(),
            covariance,
            information,
        })
    }

    /// Build the normal equations at `transform`.
    ///
    /// Chunks are processed in parallel and their partial sums are folded in
    /// chunk order, which keeps the result bit-identical across thread counts.
    fn accumulate(
        &self,
        scan: &[Point3<f64>],
        search: &CorrespondenceSearch<'_>,
        transform: &Isometry3<f64>,
    ) -> Accumulator {
        let kind = self.config.residual_kind;
        let partials: Vec<Accumulator> = scan
            .par_chunks(self.config.chunk_size.max(1))
            .map(|chunk| {
                let mut acc = Accumulator::default();
                for q in chunk {
                    let p = transform * q;
                    match search.find(&p) {
                        Some(c) => acc.add(&p, &c, kind),
                        None => acc.outliers += 1,
                    }
                }
                acc
            })
            .collect();

        partials
            .iter()
            .fold(Accumulator::default(), |total, part| total.merge(part))
    }
}
