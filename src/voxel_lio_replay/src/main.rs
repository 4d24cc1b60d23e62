mod params;
mod pointcloud;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voxel_lio::{
    points_from_raw, read_imu_log, CancelToken, LioError, Orchestrator, Pose, Scan, StepMode,
};

use params::{Overrides, ReplayParams};
use pointcloud::{filter_sensor_points, list_scan_files, read_xyz};

/// Replay an IMU log and a directory of scans through the front end.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// IMU log, one `timestamp_ns gx gy gz ax ay az` record per line
    #[arg(long)]
    imu: PathBuf,

    /// Directory of `<timestamp_ns>.xyz` scan files
    #[arg(long)]
    scans: PathBuf,

    /// TOML parameter file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the trajectory as `t x y z qx qy qz qw` lines
    #[arg(long)]
    trajectory: Option<PathBuf>,

    /// Stop after this many scans
    #[arg(long)]
    max_scans: Option<usize>,

    #[arg(long)]
    voxel_size: Option<f64>,

    #[arg(long)]
    max_iterations: Option<usize>,

    #[arg(long)]
    max_resident_cells: Option<usize>,

    /// Disable motion compensation
    #[arg(long)]
    no_deskew: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("voxel_lio=info,voxel_lio_replay=info")),
        )
        .init();

    let args = Args::parse();

    let mut params = match &args.config {
        Some(path) => ReplayParams::from_file(path)?,
        None => ReplayParams::default(),
    };
    params.apply(&Overrides {
        voxel_size: args.voxel_size,
        max_iterations: args.max_iterations,
        max_resident_cells: args.max_resident_cells,
        no_deskew: args.no_deskew,
    });

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        handler_token.cancel();
    })?;

    let (mut lio, imu) = Orchestrator::new(params.lio.clone(), cancel.clone())
        .context("Failed to create orchestrator")?;

    let imu_log = read_imu_log(&args.imu)
        .with_context(|| format!("Failed to load IMU log {}", args.imu.display()))?;
    let mut scan_files = list_scan_files(&args.scans)?;
    if let Some(max_scans) = args.max_scans {
        scan_files.truncate(max_scans);
    }
    info!(
        imu_samples = imu_log.accepted(),
        scans = scan_files.len(),
        "replay started"
    );

    let mut trajectory = match &args.trajectory {
        Some(path) => Some(BufWriter::new(File::create(path).with_context(|| {
            format!("Failed to create trajectory file {}", path.display())
        })?)),
        None => None,
    };

    let mut imu_samples = imu_log.samples.iter().peekable();
    for scan_file in &scan_files {
        if cancel.is_cancelled() {
            warn!("Interrupted");
            break;
        }
        let t = scan_file.timestamp_sec();

        // Feed IMU data up to the scan time, as a live driver would
        while let Some(sample) = imu_samples.next_if(|s| s.timestamp <= t) {
            imu.send(*sample)?;
        }

        let cloud = read_xyz(&scan_file.path)?;
        if cloud.skipped > 0 {
            warn!(
                path = %scan_file.path.display(),
                skipped = cloud.skipped,
                "skipped malformed scan lines"
            );
        }
        let filtered = filter_sensor_points(&cloud.points, &params.sensor_points);
        let points = match points_from_raw(&filtered.points) {
            Ok(points) => points,
            Err(e) => {
                warn!(path = %scan_file.path.display(), error = %e, "Skipping scan");
                continue;
            }
        };

        let report = match lio.process_scan(&Scan::new(t, points)) {
            Ok(report) => report,
            Err(LioError::Cancelled) => {
                warn!("Interrupted");
                break;
            }
            Err(e) => {
                warn!(t, error = %e, "Scan not processed");
                continue;
            }
        };

        let position = report.pose.position();
        info!(
            t,
            mode = ?report.mode,
            iterations = report.iterations,
            inliers = report.inliers,
            x = position.x,
            y = position.y,
            z = position.z,
            cells = report.resident_cells,
            "scan"
        );
        if report.mode == StepMode::Degraded {
            warn!(t, status = ?report.status, "Degraded step");
        }

        if let Some(out) = trajectory.as_mut() {
            write_pose(out, &report.pose)?;
        }
    }

    if let Some(mut out) = trajectory {
        out.flush()?;
    }

    let diagnostics = lio.diagnostics();
    info!(
        processed = diagnostics.scans_processed,
        rejected = diagnostics.scans_rejected,
        points_dropped = diagnostics.points_dropped,
        converged = diagnostics.registrations_converged,
        degraded = diagnostics.degraded_steps,
        imu_integrated = diagnostics.imu_samples_integrated,
        imu_rejected = diagnostics.imu_samples_rejected,
        window_failures = diagnostics.window_failures,
        evicted = diagnostics.cells_evicted,
        "Shutting down"
    );
    Ok(())
}

fn write_pose(out: &mut impl Write, pose: &Pose) -> Result<()> {
    let t = pose.transform.translation.vector;
    let q = pose.transform.rotation;
    writeln!(
        out,
        "{:.9} {:.6} {:.6} {:.6} {:.9} {:.9} {:.9} {:.9}",
        pose.timestamp, t.x, t.y, t.z, q.i, q.j, q.k, q.w
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Isometry3, Vector3};

    #[test]
    fn test_write_pose() {
        let pose = Pose {
            timestamp: 1.5,
            transform: Isometry3::translation(1.0, 2.0, 3.0),
            velocity: Vector3::zeros(),
        };
        let mut out = Vec::new();
        write_pose(&mut out, &pose).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "1.500000000 1.000000 2.000000 3.000000 0.000000000 0.000000000 0.000000000 1.000000000\n"
        );
    }
}
