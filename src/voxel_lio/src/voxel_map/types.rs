//! Type definitions for voxel map structures.

use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::{Matrix3, Point3, Vector3};
use serde::Deserialize;

use super::hash::HashStrategy;

/// Configuration for voxel map construction and maintenance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoxelMapConfig {
    /// Voxel side length in meters.
    pub voxel_size: f64,
    /// Bucket hashing strategy.
    pub hash_strategy: HashStrategy,
    /// Resident-cell ceiling enforced by [`super::VoxelMap::evict`].
    pub max_resident_cells: usize,
    /// Which cells go first when the ceiling is exceeded.
    pub eviction_policy: EvictionPolicy,
    /// Raw points kept per cell for nearest-point correspondence. 0 keeps none.
    pub max_points_per_cell: usize,
    /// Accumulate outer products so cells can report covariance and normals.
    pub track_covariance: bool,
}

impl Default for VoxelMapConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.5,
            hash_strategy: HashStrategy::Wide,
            max_resident_cells: 200_000,
            eviction_policy: EvictionPolicy::LeastRecentlyTouched,
            max_points_per_cell: 20,
            track_covariance: true,
        }
    }
}

impl VoxelMapConfig {
    /// Default configuration with a custom voxel size.
    pub fn with_voxel_size(voxel_size: f64) -> Self {
        Self {
            voxel_size,
            ..Default::default()
        }
    }
}

/// Order in which cells are evicted once the map is over capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Oldest last-touched stamp first.
    LeastRecentlyTouched,
    /// Largest centroid distance to the current position first.
    FarthestFromPosition,
}

/// 3D voxel coordinates (integer grid indices).
///
/// Ordering is lexicographic on (x, y, z) and is used wherever the map needs a
/// deterministic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoxelKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl VoxelKey {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Compute voxel coordinates from a 3D point.
    ///
    /// Uses `floor`, so `-0.1` lands in cell `-1` rather than `0`.
    ///
    /// Returns `None` for non-finite coordinates and for points whose grid
    /// index does not fit in an `i32`.
    pub fn from_point(point: &Point3<f64>, voxel_size: f64) -> Option<Self> {
        Some(Self {
            x: grid_index(point.x, voxel_size)?,
            y: grid_index(point.y, voxel_size)?,
            z: grid_index(point.z, voxel_size)?,
        })
    }

    /// Key shifted by an integer offset. `None` if any index overflows.
    #[inline]
    pub fn offset(&self, dx: i32, dy: i32, dz: i32) -> Option<Self> {
        Some(Self::new(
            self.x.checked_add(dx)?,
            self.y.checked_add(dy)?,
            self.z.checked_add(dz)?,
        ))
    }

    /// Center of the cell in world coordinates.
    pub fn center(&self, voxel_size: f64) -> Point3<f64> {
        Point3::new(
            (self.x as f64 + 0.5) * voxel_size,
            (self.y as f64 + 0.5) * voxel_size,
            (self.z as f64 + 0.5) * voxel_size,
        )
    }
}

fn grid_index(coordinate: f64, voxel_size: f64) -> Option<i32> {
    let index = (coordinate / voxel_size).floor();
    // NaN fails both comparisons
    (index >= i32::MIN as f64 && index <= i32::MAX as f64).then_some(index as i32)
}

/// Accumulated statistics for one voxel.
///
/// A cell only exists once a point has been added to it, so `count() > 0`
/// always holds for cells stored in a map.
#[derive(Debug)]
pub struct VoxelCell {
    /// Number of points accumulated.
    count: usize,
    /// Sum of all points (for mean computation).
    sum: Vector3<f64>,
    /// Sum of outer products (x * x^T), when covariance tracking is enabled.
    sum_sq: Option<Matrix3<f64>>,
    /// First `max_points_per_cell` raw points.
    points: Vec<Point3<f64>>,
    /// Map stamp at which the cell was last inserted into or queried.
    last_touched: AtomicU64,
}

impl VoxelCell {
    pub(crate) fn new(track_covariance: bool, stamp: u64) -> Self {
        Self {
            count: 0,
            sum: Vector3::zeros(),
            sum_sq: track_covariance.then(Matrix3::zeros),
            points: Vec::new(),
            last_touched: AtomicU64::new(stamp),
        }
    }

    /// Add a point to this cell.
    pub(crate) fn add_point(&mut self, point: &Point3<f64>, max_points: usize, stamp: u64) {
        let v = point.coords;
        self.sum += v;
        if let Some(sum_sq) = self.sum_sq.as_mut() {
            *sum_sq += v * v.transpose();
        }
        if self.points.len() < max_points {
            self.points.push(*point);
        }
        self.count += 1;
        *self.last_touched.get_mut() = stamp;
    }

    /// Record a read at `stamp`. Stamps only move forward.
    #[inline]
    pub(crate) fn touch(&self, stamp: u64) {
        self.last_touched.fetch_max(stamp, Ordering::Relaxed);
    }

    /// Number of points accumulated.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Mean of all accumulated points.
    pub fn centroid(&self) -> Point3<f64> {
        Point3::from(self.sum / self.count as f64)
    }

    /// Raw points kept for nearest-point search (possibly fewer than `count`).
    pub fn raw_points(&self) -> &[Point3<f64>] {
        &self.points
    }

    /// Map stamp of the most recent insert or query.
    pub fn last_touched(&self) -> u64 {
        self.last_touched.load(Ordering::Relaxed)
    }

    /// Sample covariance, `None` without the accumulator or with fewer than 3 points.
    ///
    /// Cov = (sum_sq - n * mean * mean^T) / (n - 1)
    pub fn covariance(&self) -> Option<Matrix3<f64>> {
        let sum_sq = self.sum_sq.as_ref()?;
        if self.count < 3 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        Some((sum_sq - mean * mean.transpose() * n) / (n - 1.0))
    }

    /// Unit normal of the local surface: eigenvector of the smallest covariance eigenvalue.
    pub fn normal(&self) -> Option<Vector3<f64>> {
        let covariance = self.covariance()?;
        let eigen = covariance.symmetric_eigen();
        let (index, _) = eigen
            .eigenvalues
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))?;
        let normal = eigen.eigenvectors.column(index).into_owned();
        let norm = normal.norm();
        if !norm.is_finite() || norm < 1e-12 {
            return None;
        }
        Some(normal / norm)
    }
}

/// Owned view of one cell for downstream consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct CellSnapshot {
    pub key: VoxelKey,
    pub centroid: Point3<f64>,
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_voxel_key_from_point() {
        let voxel_size = 2.0;

        // Point at origin
        let key = VoxelKey::from_point(&Point3::new(0.0, 0.0, 0.0), voxel_size);
        assert_eq!(key, Some(VoxelKey::new(0, 0, 0)));

        // Point in positive quadrant
        let key = VoxelKey::from_point(&Point3::new(3.5, 5.1, 1.9), voxel_size);
        assert_eq!(key, Some(VoxelKey::new(1, 2, 0)));

        // Negative coordinates floor away from zero
        let key = VoxelKey::from_point(&Point3::new(-3.5, -1.1, -0.1), voxel_size);
        assert_eq!(key, Some(VoxelKey::new(-2, -1, -1)));

        // Exactly on a negative boundary
        let key = VoxelKey::from_point(&Point3::new(-2.0, -4.0, 0.0), voxel_size);
        assert_eq!(key, Some(VoxelKey::new(-1, -2, 0)));
    }

    #[test]
    fn test_voxel_key_center_roundtrip() {
        let key = VoxelKey::new(-3, 0, 7);
        let center = key.center(0.5);
        assert_eq!(VoxelKey::from_point(&center, 0.5), Some(key));
    }

    #[test]
    fn test_voxel_key_rejects_unrepresentable_points() {
        assert!(VoxelKey::from_point(&Point3::new(f64::NAN, 0.0, 0.0), 0.5).is_none());
        assert!(VoxelKey::from_point(&Point3::new(0.0, f64::INFINITY, 0.0), 0.5).is_none());
        // 2e9 / 0.5 is past i32::MAX
        assert!(VoxelKey::from_point(&Point3::new(2.0e9, 0.0, 0.0), 0.5).is_none());
        assert!(VoxelKey::from_point(&Point3::new(0.0, 0.0, -2.0e9), 0.5).is_none());

        let key = VoxelKey::from_point(&Point3::new(1.0e9, 0.0, 0.0), 0.5).unwrap();
        assert_eq!(key.x, 2_000_000_000);
    }

    #[test]
    fn test_voxel_key_offset_overflow() {
        let edge = VoxelKey::new(i32::MAX, 0, i32::MIN);
        assert_eq!(edge.offset(0, 1, 0), Some(VoxelKey::new(i32::MAX, 1, i32::MIN)));
        assert!(edge.offset(1, 0, 0).is_none());
        assert!(edge.offset(0, 0, -1).is_none());
        assert_eq!(
            edge.offset(-1, 0, 1),
            Some(VoxelKey::new(i32::MAX - 1, 0, i32::MIN + 1))
        );
    }

    #[test]
    fn test_cell_centroid_and_covariance() {
        let mut cell = VoxelCell::new(true, 0);
        let points = [
            [1.0, 2.0, 3.0],
            [1.1, 2.1, 3.1],
            [0.9, 1.9, 2.9],
            [1.05, 2.05, 3.05],
            [0.95, 1.95, 2.95],
        ];
        for p in &points {
            cell.add_point(&Point3::new(p[0], p[1], p[2]), 3, 1);
        }

        assert_eq!(cell.count(), 5);
        assert_eq!(cell.raw_points().len(), 3);
        assert_relative_eq!(cell.centroid(), Point3::new(1.0, 2.0, 3.0), epsilon = 1e-12);

        let cov = cell.covariance().unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(cov[(i, j)], cov[(j, i)], epsilon = 1e-12);
            }
        }
        assert!(cov.norm() < 0.1);
    }

    #[test]
    fn test_cell_without_accumulator_has_no_covariance() {
        let mut cell = VoxelCell::new(false, 0);
        for i in 0..5 {
            cell.add_point(&Point3::new(i as f64, 0.0, 0.0), 0, 0);
        }
        assert!(cell.covariance().is_none());
        assert!(cell.normal().is_none());
        assert!(cell.raw_points().is_empty());
    }

    #[test]
    fn test_plane_normal() {
        let mut cell = VoxelCell::new(true, 0);
        for i in 0..5 {
            for j in 0..5 {
                cell.add_point(&Point3::new(i as f64 * 0.1, j as f64 * 0.1, 2.0), 0, 0);
            }
        }
        let normal = cell.normal().unwrap();
        assert_relative_eq!(normal.z.abs(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_touch_only_moves_forward() {
        let cell = VoxelCell::new(false, 5);
        cell.touch(3);
        assert_eq!(cell.last_touched(), 5);
        cell.touch(9);
        assert_eq!(cell.last_touched(), 9);
    }
}
