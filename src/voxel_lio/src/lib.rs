//! Voxel-hashed LiDAR-inertial odometry front end.
//!
//! Scans are registered against a voxel-hashed map with a Gauss-Newton solver
//! seeded by IMU pre-integration.
//!
//! # Architecture
//!
//! - [`voxel_map`]: voxel cells keyed by integer coordinates, with bounded or
//!   wide bucket hashing and a resident-cell ceiling
//! - [`registration`]: correspondence search and Gauss-Newton alignment
//! - [`imu`]: windowed on-manifold pre-integration with bias Jacobians
//! - [`fusion`]: the per-scan step tying the pieces together
//! - [`io`]: IMU log parsing and point conversion
//!
//! # Usage
//!
//! ```ignore
//! use voxel_lio::{CancelToken, LioConfig, Orchestrator, Scan};
//!
//! let (mut lio, imu) = Orchestrator::new(LioConfig::default(), CancelToken::new())?;
//!
//! // IMU samples may come from any thread
//! for sample in read_imu_log("imu.txt")?.samples {
//!     imu.send(sample)?;
//! }
//!
//! let report = lio.process_scan(&Scan::new(timestamp, points))?;
//! println!("{:?} at {}", report.mode, report.pose.position());
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod fusion;
pub mod geometry;
pub mod imu;
pub mod io;
pub mod registration;
pub mod test_utils;
pub mod voxel_map;

pub use cancel::CancelToken;
pub use config::{ImuConfig, LioConfig};
pub use error::{LioError, Result};
pub use fusion::{
    Diagnostics, ImuSender, IngestStats, Orchestrator, Pose, Scan, StepMode, StepReport,
};
pub use imu::{ImuBias, ImuNoise, ImuSample, PreintegratedDelta, Preintegrator};
pub use io::{parse_imu_log, points_from_raw, read_imu_log, ImuLog};
pub use registration::{
    CorrespondencePolicy, RegistrationConfig, RegistrationResult, RegistrationSolver,
    RegistrationStatus, ResidualKind,
};
pub use voxel_map::{EvictionPolicy, HashStrategy, VoxelKey, VoxelMap, VoxelMapConfig};
