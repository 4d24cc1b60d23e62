//! Correspondence search against the voxel map.
//!
//! A transformed scan point is matched to the closest target found in the
//! `(2r+1)^3` neighborhood of its cell. The target is either a cell centroid
//! or one of the raw points kept in the cell, chosen by [`CorrespondencePolicy`].

use nalgebra::{Point3, Vector3};
use serde::Deserialize;

use crate::voxel_map::{VoxelKey, VoxelMap};

/// What a scan point is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrespondencePolicy {
    /// Closest cell centroid.
    #[default]
    Centroid,
    /// Closest raw point stored in any neighboring cell. Cells without raw
    /// points contribute their centroid.
    NearestRawPoint,
}

/// A matched target for one query point.
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondence {
    /// Cell the target belongs to.
    pub key: VoxelKey,
    /// Target position in map coordinates.
    pub target: Point3<f64>,
    /// Surface normal of the target cell, when requested and available.
    pub normal: Option<Vector3<f64>>,
    /// Squared distance between the query point and the target.
    pub distance_sq: f64,
}

/// Nearest-target lookup over a borrowed map.
#[derive(Debug, Clone, Copy)]
pub struct CorrespondenceSearch<'a> {
    map: &'a VoxelMap,
    policy: CorrespondencePolicy,
    radius: u32,
    max_distance_sq: f64,
    with_normals: bool,
}

impl<'a> CorrespondenceSearch<'a> {
    /// Create a search.
    ///
    /// # Arguments
    /// * `map` - Target map
    /// * `policy` - Centroid or raw-point matching
    /// * `radius` - Neighborhood radius in cells
    /// * `max_distance` - Matches farther than this are rejected as outliers
    pub fn new(
        map: &'a VoxelMap,
        policy: CorrespondencePolicy,
        radius: u32,
        max_distance: f64,
    ) -> Self {
        Self {
            map,
            policy,
            radius,
            max_distance_sq: max_distance * max_distance,
            with_normals: false,
        }
    }

    /// Also report the target cell's normal (needed for point-to-plane residuals).
    pub fn with_normals(mut self, with_normals: bool) -> Self {
        self.with_normals = with_normals;
        self
    }

    /// Find the closest target for `point`.
    ///
    /// Returns `None` when nothing lies within the maximum distance. Equal
    /// distances keep the first candidate in neighborhood order.
    pub fn find(&self, point: &Point3<f64>) -> Option<Correspondence> {
        let mut best: Option<(VoxelKey, Point3<f64>, f64)> = None;

        for (key, cell) in self.map.query_neighborhood(point, self.radius) {
            let candidate = match self.policy {
                CorrespondencePolicy::Centroid => {
                    let c = cell.centroid();
                    Some((c, (c - point).norm_squared()))
                }
                CorrespondencePolicy::NearestRawPoint if cell.raw_points().is_empty() => {
                    let c = cell.centroid();
                    Some((c, (c - point).norm_squared()))
                }
                CorrespondencePolicy::NearestRawPoint => {
                    let mut nearest: Option<(Point3<f64>, f64)> = None;
                    for raw in cell.raw_points() {
                        let d = (raw - point).norm_squared();
                        if nearest.map_or(true, |(_, best_d)| d < best_d) {
                            nearest = Some((*raw, d));
                        }
                    }
                    nearest
                }
            };

            if let Some((target, distance_sq)) = candidate {
                if distance_sq <= self.max_distance_sq
                    && best.map_or(true, |(_, _, best_d)| distance_sq < best_d)
                {
                    best = Some((key, target, distance_sq));
                }
            }
        }

        let (key, target, distance_sq) = best?;
        let normal = if self.with_normals {
            self.map.get(&key).and_then(|cell| cell.normal())
        } else {
            None
        };

        Some(Correspondence {
            key,
            target,
            normal,
            distance_sq,
        })
    }
}
