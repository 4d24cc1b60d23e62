//! Synthetic data generators for tests and benchmarks.
//!
//! Every generator that draws random numbers takes a caller-owned RNG, so a
//! seeded `StdRng` reproduces the same data on every run.

use nalgebra::{Isometry3, Point3, Vector3};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use tracing::debug;

use crate::imu::ImuSample;

/// Three mutually orthogonal planar patches that do not touch.
///
/// - floor: `z = offset`, `x, y` in `[gap, gap + length]`
/// - wall: `x = offset`, `y, z` in `[gap, gap + length]`
/// - wall: `y = offset`, `x, z` in `[gap, gap + length]`
///
/// Samples sit at half-interval offsets so that none lands on a cell
/// boundary when `interval` divides the voxel size.
pub fn make_separated_planes(length: f64, interval: f64, gap: f64, offset: f64) -> Vec<Point3<f64>> {
    let n = (length / interval).round() as usize;
    let mut points = Vec::with_capacity(3 * n * n);

    for i in 0..n {
        for j in 0..n {
            let u = gap + (j as f64 + 0.5) * interval;
            let v = gap + (i as f64 + 0.5) * interval;
            points.push(Point3::new(u, v, offset));
            points.push(Point3::new(offset, u, v));
            points.push(Point3::new(u, offset, v));
        }
    }

    points
}

/// Uniform random points in `[-half_extent, half_extent]^3`, pairwise at
/// least `min_separation` apart.
///
/// Uses rejection sampling and gives up after `100 * count` attempts, so the
/// result may be shorter than `count` for infeasible densities.
pub fn random_points_min_separation<R: Rng>(
    rng: &mut R,
    count: usize,
    half_extent: f64,
    min_separation: f64,
) -> Vec<Point3<f64>> {
    let uniform = Uniform::new_inclusive(-half_extent, half_extent);
    let min_sq = min_separation * min_separation;
    let mut points: Vec<Point3<f64>> = Vec::with_capacity(count);

    for _ in 0..count * 100 {
        if points.len() == count {
            break;
        }
        let candidate = Point3::new(
            uniform.sample(rng),
            uniform.sample(rng),
            uniform.sample(rng),
        );
        if points
            .iter()
            .all(|p| (p - candidate).norm_squared() >= min_sq)
        {
            points.push(candidate);
        }
    }

    points
}

/// Apply a rigid transform to every point.
pub fn transform_points(points: &[Point3<f64>], transform: &Isometry3<f64>) -> Vec<Point3<f64>> {
    points.iter().map(|p| transform * p).collect()
}

/// IMU samples with constant readings at `rate_hz`, covering `[start, end]`.
pub fn constant_imu_stream(
    start: f64,
    end: f64,
    rate_hz: f64,
    gyro: Vector3<f64>,
    accel: Vector3<f64>,
) -> Vec<ImuSample> {
    sample_times(start, end, rate_hz)
        .map(|t| ImuSample::new(t, gyro, accel))
        .collect()
}

/// IMU samples with Gaussian noise of standard deviation `noise_std` added
/// to each reading.
pub fn noisy_imu_stream<R: Rng>(
    rng: &mut R,
    start: f64,
    end: f64,
    rate_hz: f64,
    gyro: Vector3<f64>,
    accel: Vector3<f64>,
    noise_std: f64,
) -> Vec<ImuSample> {
    sample_times(start, end, rate_hz)
        .map(|t| {
            let gyro_noise = gaussian_vector(rng, noise_std);
            let accel_noise = gaussian_vector(rng, noise_std);
            ImuSample::new(t, gyro + gyro_noise, accel + accel_noise)
        })
        .collect()
}

fn gaussian_vector<R: Rng>(rng: &mut R, std_dev: f64) -> Vector3<f64> {
    let mut draw = || -> f64 { StandardNormal.sample(rng) };
    Vector3::new(draw(), draw(), draw()) * std_dev
}

fn sample_times(start: f64, end: f64, rate_hz: f64) -> impl Iterator<Item = f64> {
    let n = ((end - start) * rate_hz).round() as usize;
    (0..=n).map(move |i| start + i as f64 / rate_hz)
}

/// Random curve parameters and noisy samples of the curve.
#[derive(Debug, Clone)]
pub struct CurveData {
    pub parameters: Vec<f64>,
    /// `(x, f(parameters, x) + noise)` with `x = i / size`.
    pub samples: Vec<(f64, f64)>,
}

/// Draw `param_count` parameters uniformly from `param_range`, then sample
/// `func` at `data_size` evenly spaced `x` in `[0, 1)` with uniform noise from
/// `noise_range`.
pub fn generate_curve_data<R, F>(
    rng: &mut R,
    func: F,
    param_count: usize,
    data_size: usize,
    param_range: (f64, f64),
    noise_range: (f64, f64),
) -> CurveData
where
    R: Rng,
    F: Fn(&[f64], f64) -> f64,
{
    let parameters: Vec<f64> = (0..param_count)
        .map(|_| rng.gen_range(param_range.0..=param_range.1))
        .collect();

    let samples = (0..data_size)
        .map(|i| {
            let x = i as f64 / data_size as f64;
            let noise = rng.gen_range(noise_range.0..=noise_range.1);
            (x, func(&parameters, x) + noise)
        })
        .collect();

    debug!(?parameters, "generated curve data");
    CurveData {
        parameters,
        samples,
    }
}
