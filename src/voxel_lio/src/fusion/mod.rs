//! LiDAR-inertial fusion loop.
//!
//! - [`ingest`]: IMU producer channel and consumer buffer
//! - [`deskew`]: per-point motion compensation
//! - [`orchestrator`]: the per-scan step
//! - [`types`]: scans, poses and step reports

pub mod deskew;
pub mod ingest;
pub mod orchestrator;
pub mod types;

pub use deskew::deskew;
pub use ingest::{ImuSender, IngestStats};
pub use orchestrator::Orchestrator;
pub use types::{Diagnostics, Pose, Scan, StepMode, StepReport};
