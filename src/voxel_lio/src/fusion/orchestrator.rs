//! Per-scan fusion step.
//!
//! Each call to [`Orchestrator::process_scan`] runs one full step:
//!
//! 1. Drain IMU samples up to the scan time into the open window
//! 2. Close the window and predict the motion-only pose
//! 3. Deskew the scan against the predicted motion
//! 4. Register against the map, starting from the prediction
//! 5. Insert the aligned points and enforce the resident-cell ceiling
//!
//! When the window cannot be closed the prediction falls back to constant
//! velocity. When registration does not converge the prediction is kept and
//! the step is reported as degraded.

use std::sync::Arc;

use nalgebra::{Isometry3, Point3, Translation3, Vector3};
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::deskew::deskew;
use super::ingest::{channel, ImuQueue, ImuSender};
use super::types::{Diagnostics, Pose, Scan, StepMode, StepReport};
use crate::cancel::CancelToken;
use crate::config::LioConfig;
use crate::error::{LioError, Result};
use crate::imu::{ImuBias, ImuSample, PreintegratedDelta, Preintegrator};
use crate::registration::{RegistrationSolver, RegistrationStatus};
use crate::voxel_map::{CellSnapshot, VoxelMap};

/// Registration outcome folded into the step report.
struct Alignment {
    mode: StepMode,
    status: Option<RegistrationStatus>,
    transform: Isometry3<f64>,
    iterations: usize,
    inliers: usize,
    outliers: usize,
}

/// Owns the map, the solver and the open IMU window.
pub struct Orchestrator {
    config: LioConfig,
    map: VoxelMap,
    solver: RegistrationSolver,
    preintegrator: Option<Preintegrator>,
    imu_queue: ImuQueue,
    imu_sender: ImuSender,
    bias: ImuBias,
    gravity: Vector3<f64>,
    pose: Option<Pose>,
    diagnostics: Arc<Mutex<Diagnostics>>,
    cancel: CancelToken,
}

impl Orchestrator {
    /// Build an orchestrator and the sender feeding its IMU queue.
    ///
    /// # Errors
    /// [`LioError::Input`] for an invalid configuration.
    pub fn new(config: LioConfig, cancel: CancelToken) -> Result<(Self, ImuSender)> {
        config.validate()?;
        let map = VoxelMap::new(config.voxel_map.clone())?;
        let solver = RegistrationSolver::new(config.registration.clone());
        let (imu_sender, imu_queue) = channel();

        info!(
            voxel_size = config.voxel_map.voxel_size,
            hash = ?config.voxel_map.hash_strategy,
            residual = ?config.registration.residual_kind,
            deskew = config.deskew,
            "fusion orchestrator created"
        );

        let orchestrator = Self {
            bias: config.imu.initial_bias(),
            gravity: config.imu.gravity(),
            config,
            map,
            solver,
            preintegrator: None,
            imu_queue,
            imu_sender: imu_sender.clone(),
            pose: None,
            diagnostics: Arc::new(Mutex::new(Diagnostics::default())),
            cancel,
        };
        Ok((orchestrator, imu_sender))
    }

    /// Another producer handle for the IMU queue.
    pub fn imu_sender(&self) -> ImuSender {
        self.imu_sender.clone()
    }

    /// Set the bias used from the next window close on.
    ///
    /// The part of the open window integrated with the previous bias is
    /// re-linearized when the window closes.
    pub fn set_bias(&mut self, bias: ImuBias) {
        debug!(gyro = ?bias.gyro, accel = ?bias.accel, "IMU bias updated");
        self.bias = bias;
    }

    pub fn bias(&self) -> &ImuBias {
        &self.bias
    }

    /// Latest pose, `None` before the first scan.
    pub fn pose(&self) -> Option<&Pose> {
        self.pose.as_ref()
    }

    pub fn map(&self) -> &VoxelMap {
        &self.map
    }

    pub fn snapshot(&self) -> Vec<CellSnapshot> {
        self.map.snapshot()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.lock().clone()
    }

    /// Shared handle for reading counters from another thread.
    pub fn diagnostics_handle(&self) -> Arc<Mutex<Diagnostics>> {
        Arc::clone(&self.diagnostics)
    }

    /// Run one fusion step for a scan.
    ///
    /// # Errors
    /// * [`LioError::Cancelled`] if the cancel token fired
    /// * [`LioError::Input`] for a non-finite timestamp or a scan without a
    ///   single finite point
    /// * [`LioError::TemporalOrder`] if the scan is not after the previous one
    ///
    /// Non-finite points are dropped and counted in
    /// [`Diagnostics::points_dropped`]. Rejected scans leave the state
    /// unchanged. Registration and window
    /// failures do not surface as errors; they are reported through
    /// [`StepReport::mode`] and the diagnostics counters.
    pub fn process_scan(&mut self, scan: &Scan) -> Result<StepReport> {
        if self.cancel.is_cancelled() {
            return Err(LioError::Cancelled);
        }
        let points = self.checked_points(scan).inspect_err(|e| {
            self.diagnostics.lock().scans_rejected += 1;
            warn!(t = scan.timestamp, error = %e, "scan rejected");
        })?;
        let dropped = scan.points.len() - points.len();
        if dropped > 0 {
            self.diagnostics.lock().points_dropped += dropped as u64;
            warn!(t = scan.timestamp, dropped, "dropped non-finite scan points");
        }

        let t = scan.timestamp;
        let samples = self.imu_queue.drain_until(t);

        let Some(previous) = self.pose.clone() else {
            return Ok(self.bootstrap(t, points, samples));
        };

        let (imu_samples, delta) = self.integrate_window(samples, t);
        let dt = t - previous.timestamp;
        let (predicted, predicted_velocity) = match &delta {
            Some(delta) => delta.predict(&previous.transform, &previous.velocity, &self.gravity),
            None => {
                let translation = previous.transform.translation.vector + previous.velocity * dt;
                (
                    Isometry3::from_parts(
                        Translation3::from(translation),
                        previous.transform.rotation,
                    ),
                    previous.velocity,
                )
            }
        };

        let points = if self.config.deskew {
            let start_in_end = predicted.inverse() * previous.transform;
            deskew(&points, &start_in_end)
        } else {
            points
        };

        let alignment = if self.map.is_empty() {
            Alignment::unregistered(StepMode::Bootstrap, predicted)
        } else {
            self.register(&points, predicted)?
        };

        let velocity = match alignment.mode {
            StepMode::Registered => {
                let correction =
                    alignment.transform.translation.vector - predicted.translation.vector;
                predicted_velocity + correction / dt
            }
            StepMode::Bootstrap | StepMode::Degraded => predicted_velocity,
        };
        let pose = Pose {
            timestamp: t,
            transform: alignment.transform,
            velocity,
        };

        Ok(self.finish_step(&points, pose, alignment, imu_samples))
    }

    /// Validate the scan and return its finite points.
    fn checked_points(&self, scan: &Scan) -> Result<Vec<Point3<f64>>> {
        if !scan.timestamp.is_finite() {
            return Err(LioError::Input("non-finite scan timestamp".to_string()));
        }
        if let Some(previous) = &self.pose {
            if scan.timestamp <= previous.timestamp {
                return Err(LioError::TemporalOrder {
                    previous: previous.timestamp,
                    current: scan.timestamp,
                });
            }
        }
        if scan.points.is_empty() {
            return Err(LioError::Input(format!("empty scan at {}", scan.timestamp)));
        }

        let points: Vec<Point3<f64>> = scan
            .points
            .iter()
            .filter(|p| p.coords.iter().all(|v| v.is_finite()))
            .copied()
            .collect();
        if points.is_empty() {
            return Err(LioError::Input(format!(
                "scan at {} has no finite points",
                scan.timestamp
            )));
        }
        Ok(points)
    }

    /// First scan: anchor the map frame at the sensor and open the window.
    fn bootstrap(
        &mut self,
        t: f64,
        points: Vec<Point3<f64>>,
        samples: Vec<ImuSample>,
    ) -> StepReport {
        let mut preintegrator = Preintegrator::new(t, self.bias, self.config.imu.noise);
        let imu_samples = self.push_samples(&mut preintegrator, samples);
        self.preintegrator = Some(preintegrator);

        let pose = Pose {
            timestamp: t,
            transform: Isometry3::identity(),
            velocity: Vector3::zeros(),
        };
        info!(t, points = points.len(), "map bootstrapped");
        let alignment = Alignment::unregistered(StepMode::Bootstrap, pose.transform);
        self.finish_step(&points, pose, alignment, imu_samples)
    }

    /// Integrate the drained samples and close the window at `t`.
    ///
    /// Returns the number of integrated samples and the delta, or `None` when
    /// the window failed and a fresh one was opened at `t`.
    fn integrate_window(
        &mut self,
        samples: Vec<ImuSample>,
        t: f64,
    ) -> (usize, Option<PreintegratedDelta>) {
        let mut preintegrator = self.preintegrator.take().unwrap_or_else(|| {
            Preintegrator::new(t, self.bias, self.config.imu.noise)
        });
        let imu_samples = self.push_samples(&mut preintegrator, samples);

        let delta = match preintegrator.close(t) {
            Ok(delta) if delta.bias != self.bias => Some(delta.corrected(&self.bias)),
            Ok(delta) => Some(delta),
            Err(e) => {
                self.diagnostics.lock().window_failures += 1;
                warn!(t, error = %e, "IMU window failed, using constant velocity");
                preintegrator = match preintegrator.last_sample() {
                    Some(last) if last.timestamp <= t => Preintegrator::with_carry_over(
                        t,
                        self.bias,
                        self.config.imu.noise,
                        *last,
                    ),
                    _ => Preintegrator::new(t, self.bias, self.config.imu.noise),
                };
                None
            }
        };
        preintegrator.set_bias(self.bias);
        self.preintegrator = Some(preintegrator);
        (imu_samples, delta)
    }

    /// Push drained samples into the open window.
    ///
    /// Returns how many advanced the window. Samples at or before the window
    /// start only replace the carry-over sample and are not counted.
    fn push_samples(&self, preintegrator: &mut Preintegrator, samples: Vec<ImuSample>) -> usize {
        let before = preintegrator.current().sample_count;
        let mut rejected = 0;
        for sample in samples {
            if let Err(e) = preintegrator.push(sample) {
                rejected += 1;
                warn!(t = sample.timestamp, error = %e, "IMU sample dropped");
            }
        }
        let integrated = preintegrator.current().sample_count - before;

        let mut diagnostics = self.diagnostics.lock();
        diagnostics.imu_samples_integrated += integrated as u64;
        diagnostics.imu_samples_rejected += rejected;
        integrated
    }

    fn register(
        &self,
        points: &[Point3<f64>],
        predicted: Isometry3<f64>,
    ) -> Result<Alignment> {
        match self.solver.align(points, &self.map, predicted, &self.cancel) {
            Ok(result) if result.status.is_converged() => Ok(Alignment {
                mode: StepMode::Registered,
                status: Some(result.status),
                transform: result.transform,
                iterations: result.iterations,
                inliers: result.inliers,
                outliers: result.outliers,
            }),
            Ok(result) => {
                warn!(
                    status = ?result.status,
                    iterations = result.iterations,
                    inliers = result.inliers,
                    "registration did not converge, keeping motion-only pose"
                );
                Ok(Alignment {
                    mode: StepMode::Degraded,
                    status: Some(result.status),
                    transform: predicted,
                    iterations: result.iterations,
                    inliers: result.inliers,
                    outliers: result.outliers,
                })
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "registration failed, keeping motion-only pose");
                Ok(Alignment::unregistered(StepMode::Degraded, predicted))
            }
            Err(e) => Err(e),
        }
    }

    /// Insert the aligned scan, evict, update counters and build the report.
    fn finish_step(
        &mut self,
        points: &[Point3<f64>],
        pose: Pose,
        alignment: Alignment,
        imu_samples: usize,
    ) -> StepReport {
        let transform = pose.transform;
        let aligned: Vec<Point3<f64>> = points.par_iter().map(|p| transform * p).collect();
        self.map.insert_points(&aligned);
        self.map.advance_stamp();
        let evicted = self.map.evict(&pose.position());
        let resident_cells = self.map.len();

        {
            let mut diagnostics = self.diagnostics.lock();
            diagnostics.scans_processed += 1;
            diagnostics.cells_evicted += evicted as u64;
            match alignment.mode {
                StepMode::Registered => diagnostics.registrations_converged += 1,
                StepMode::Degraded => diagnostics.degraded_steps += 1,
                StepMode::Bootstrap => {}
            }
        }

        debug!(
            t = pose.timestamp,
            mode = ?alignment.mode,
            iterations = alignment.iterations,
            inliers = alignment.inliers,
            evicted,
            resident_cells,
            "scan processed"
        );

        self.pose = Some(pose.clone());
        StepReport {
            mode: alignment.mode,
            status: alignment.status,
            pose,
            iterations: alignment.iterations,
            inliers: alignment.inliers,
            outliers: alignment.outliers,
            imu_samples,
            evicted,
            resident_cells,
        }
    }
}

impl Alignment {
    fn unregistered(mode: StepMode, transform: Isometry3<f64>) -> Self {
        Self {
            mode,
            status: None,
            transform,
            iterations: 0,
            inliers: 0,
            outliers: 0,
        }
    }
}
