//! Scan file reading and sensor point filtering.
//!
//! Scan files are named `<timestamp_ns>.xyz` and hold one `x y z` record per
//! line. Malformed lines are skipped.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Parameters for filtering sensor points
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PointFilterParams {
    /// Minimum distance from sensor origin (default: 0.0)
    pub min_distance: f32,
    /// Maximum distance from sensor origin (default: f32::MAX)
    pub max_distance: f32,
    /// Minimum z value (ground filtering, default: f32::MIN)
    pub min_z: f32,
    /// Maximum z value (ceiling filtering, default: f32::MAX)
    pub max_z: f32,
}

impl Default for PointFilterParams {
    fn default() -> Self {
        Self {
            min_distance: 0.0,
            max_distance: f32::MAX,
            min_z: f32::MIN,
            max_z: f32::MAX,
        }
    }
}

/// Result of point filtering operation
#[derive(Debug)]
pub struct FilterResult {
    /// Filtered points
    pub points: Vec<[f32; 3]>,
    /// Number of points removed by distance filter
    pub removed_by_distance: usize,
    /// Number of points removed by z filter
    pub removed_by_z: usize,
}

/// Filter sensor points based on distance and z-height constraints.
///
/// The distance test runs first; a point failing both is counted once, as a
/// distance removal.
pub fn filter_sensor_points(points: &[[f32; 3]], params: &PointFilterParams) -> FilterResult {
    let min_sq = params.min_distance * params.min_distance;
    let max_sq = params.max_distance * params.max_distance;
    let mut result = FilterResult {
        points: Vec::with_capacity(points.len()),
        removed_by_distance: 0,
        removed_by_z: 0,
    };

    for p in points {
        let dist_sq = p[0] * p[0] + p[1] * p[1] + p[2] * p[2];
        if dist_sq < min_sq || dist_sq > max_sq {
            result.removed_by_distance += 1;
        } else if p[2] < params.min_z || p[2] > params.max_z {
            result.removed_by_z += 1;
        } else {
            result.points.push(*p);
        }
    }

    result
}

/// One scan file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFile {
    pub timestamp_ns: u64,
    pub path: PathBuf,
}

impl ScanFile {
    pub fn timestamp_sec(&self) -> f64 {
        self.timestamp_ns as f64 / 1.0e9
    }
}

/// List `<timestamp_ns>.xyz` files in `dir`, sorted by timestamp.
///
/// Files with another extension or a non-numeric stem are ignored.
pub fn list_scan_files(dir: &Path) -> Result<Vec<ScanFile>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read scan directory {}", dir.display()))?;

    let mut scans = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("xyz") {
            continue;
        }
        let Some(timestamp_ns) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        scans.push(ScanFile { timestamp_ns, path });
    }

    scans.sort_by_key(|s| s.timestamp_ns);
    Ok(scans)
}

/// Points read from a scan file.
#[derive(Debug, Default)]
pub struct XyzCloud {
    pub points: Vec<[f32; 3]>,
    /// Blank or malformed lines.
    pub skipped: usize,
}

/// Parse `x y z` records. Extra fields (intensity, ring) are ignored.
pub fn parse_xyz(text: &str) -> XyzCloud {
    let mut cloud = XyzCloud::default();
    for line in text.lines() {
        let mut fields = line.split_whitespace().map(str::parse::<f32>);
        let mut point = [0.0f32; 3];
        let mut ok = true;
        for value in point.iter_mut() {
            match fields.next() {
                Some(Ok(v)) => *value = v,
                _ => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            cloud.points.push(point);
        } else {
            cloud.skipped += 1;
        }
    }
    cloud
}

/// Read a scan file.
pub fn read_xyz(path: &Path) -> Result<XyzCloud> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scan {}", path.display()))?;
    Ok(parse_xyz(&text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xyz() {
        let text = "1.0 2.0 3.0\n\nbad line\n4 5 6 0.5\n7 8\n";
        let cloud = parse_xyz(text);

        assert_eq!(cloud.points, vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(cloud.skipped, 3);
    }

    #[test]
    fn test_list_scan_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["2000.xyz", "1000.xyz", "notes.txt", "abc.xyz", "1500.xyz"] {
            fs::write(dir.path().join(name), "0 0 0\n").unwrap();
        }

        let scans = list_scan_files(dir.path()).unwrap();
        let stamps: Vec<u64> = scans.iter().map(|s| s.timestamp_ns).collect();
        assert_eq!(stamps, vec![1000, 1500, 2000]);
        assert_eq!(scans[0].timestamp_sec(), 1.0e-6);
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_scan_files(&dir.path().join("missing")).is_err());
    }

    fn ring_params() -> PointFilterParams {
        PointFilterParams {
            min_distance: 2.0,
            max_distance: 20.0,
            min_z: -1.5,
            max_z: 4.0,
        }
    }

    #[test]
    fn test_point_failing_both_tests_counts_as_distance() {
        // Too close and below the ground plane
        let points = [[0.5, 0.0, -1.6], [3.0, 0.0, -2.0], [6.0, 8.0, 0.0]];
        let result = filter_sensor_points(&points, &ring_params());

        assert_eq!(result.removed_by_distance, 1);
        assert_eq!(result.removed_by_z, 1);
        assert_eq!(result.points, vec![[6.0, 8.0, 0.0]]);
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let points = [
            [2.0, 0.0, 0.0],
            [0.0, 20.0, 0.0],
            [0.0, 20.5, 0.0],
            [0.0, 3.0, -1.5],
            [0.0, 3.0, 4.0],
        ];
        let result = filter_sensor_points(&points, &ring_params());

        assert_eq!(result.points.len(), 4);
        assert_eq!(result.removed_by_distance, 1);
        assert_eq!(result.removed_by_z, 0);
    }

    #[test]
    fn test_non_finite_points_pass_through() {
        let points = [[f32::NAN, 1.0, 1.0], [3.0, 0.0, f32::NAN]];
        let result = filter_sensor_points(&points, &ring_params());
        assert_eq!(result.points.len(), 2);

        // Dropped when converted for the front end
        let finite = voxel_lio::points_from_raw(&[points[0], [3.0, 0.0, 1.0]]).unwrap();
        assert_eq!(finite.len(), 1);
    }
}
