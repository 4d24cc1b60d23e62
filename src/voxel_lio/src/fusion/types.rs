//! Type definitions for the fusion pipeline.

use nalgebra::{Isometry3, Point3, Vector3};

use crate::registration::RegistrationStatus;

/// One sweep of the ranging sensor.
#[derive(Debug, Clone)]
pub struct Scan {
    /// End of capture (s).
    pub timestamp: f64,
    /// Points in the sensor frame, in capture order.
    pub points: Vec<Point3<f64>>,
}

impl Scan {
    pub fn new(timestamp: f64, points: Vec<Point3<f64>>) -> Self {
        Self { timestamp, points }
    }
}

/// Navigation state at a scan time.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    /// Seconds.
    pub timestamp: f64,
    /// Sensor-to-map transform.
    pub transform: Isometry3<f64>,
    /// Velocity in the map frame (m/s).
    pub velocity: Vector3<f64>,
}

impl Pose {
    /// Sensor position in the map.
    pub fn position(&self) -> Point3<f64> {
        Point3::from(self.transform.translation.vector)
    }
}

/// How the pose of a step was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Map was empty; the scan seeded it at the predicted pose.
    Bootstrap,
    /// Registration converged.
    Registered,
    /// Registration failed; the motion-only prediction was kept.
    Degraded,
}

/// Outcome of one orchestrator step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub mode: StepMode,
    /// Registration status, `None` when no registration ran.
    pub status: Option<RegistrationStatus>,
    pub pose: Pose,
    pub iterations: usize,
    pub inliers: usize,
    pub outliers: usize,
    /// IMU samples integrated for this step.
    pub imu_samples: usize,
    /// Cells evicted after insertion.
    pub evicted: usize,
    /// Cells resident after eviction.
    pub resident_cells: usize,
}

/// Running counters over the lifetime of an orchestrator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    /// Scans that completed a step.
    pub scans_processed: u64,
    /// Scans rejected before processing (empty, out of order).
    pub scans_rejected: u64,
    /// Non-finite points removed from accepted scans.
    pub points_dropped: u64,
    pub registrations_converged: u64,
    /// Steps that fell back to the motion-only pose.
    pub degraded_steps: u64,
    /// IMU samples that advanced a window. Carry-over samples are excluded.
    pub imu_samples_integrated: u64,
    /// IMU samples refused by the pre-integrator (order, non-finite).
    pub imu_samples_rejected: u64,
    /// Windows that could not be closed; constant velocity was used instead.
    pub window_failures: u64,
    pub cells_evicted: u64,
}
