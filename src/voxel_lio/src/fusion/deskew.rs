//! Motion compensation for points captured while the sensor moves.
//!
//! A scan is timestamped at the end of capture and its points are ordered by
//! capture time. Point `i` of `n` is assumed to be captured at fraction
//! `i / (n - 1)` of the sweep. Its sensor pose relative to the end of the
//! sweep is interpolated between `start_in_end` (fraction 0) and identity
//! (fraction 1), and the point is re-expressed in the end frame.

use nalgebra::{Isometry3, Point3};
use rayon::prelude::*;

/// Re-express every point in the sensor frame at the end of the sweep.
///
/// # Arguments
/// * `points` - Raw points in capture order
/// * `start_in_end` - Sensor pose at sweep start, expressed in the end frame
pub fn deskew(points: &[Point3<f64>], start_in_end: &Isometry3<f64>) -> Vec<Point3<f64>> {
    let n = points.len();
    if n < 2 {
        return points.to_vec();
    }
    let last = (n - 1) as f64;
    let identity = Isometry3::identity();

    points
        .par_iter()
        .enumerate()
        .map(|(i, p)| {
            let fraction = i as f64 / last;
            start_in_end.lerp_slerp(&identity, fraction) * p
        })
        .collect()
}
