//! IMU measurement, bias and noise types.

use nalgebra::Vector3;
use serde::Deserialize;

/// Gravity vector in world frame (m/s^2).
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

/// Single IMU measurement in the body frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    /// Seconds.
    pub timestamp: f64,
    /// Angular velocity (rad/s).
    pub gyro: Vector3<f64>,
    /// Specific force (m/s^2), gravity included.
    pub accel: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp: f64, gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        Self {
            timestamp,
            gyro,
            accel,
        }
    }

    /// Check that every field is finite.
    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite()
            && self.gyro.iter().all(|v| v.is_finite())
            && self.accel.iter().all(|v| v.is_finite())
    }

    /// Linear interpolation of the measurement at time `t`.
    pub(crate) fn interpolate(&self, next: &ImuSample, t: f64) -> ImuSample {
        let span = next.timestamp - self.timestamp;
        let alpha = if span > 0.0 {
            ((t - self.timestamp) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        ImuSample {
            timestamp: t,
            gyro: self.gyro.lerp(&next.gyro, alpha),
            accel: self.accel.lerp(&next.accel, alpha),
        }
    }

    /// The same measurement re-stamped at `t`.
    pub(crate) fn held_at(&self, t: f64) -> ImuSample {
        ImuSample {
            timestamp: t,
            ..*self
        }
    }
}

/// Gyroscope and accelerometer biases.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ImuBias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl ImuBias {
    pub fn new(gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        Self { gyro, accel }
    }

    pub fn zero() -> Self {
        Self::default()
    }
}

/// White-noise densities used for covariance propagation.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ImuNoise {
    /// Gyroscope noise density (rad/s/sqrt(Hz)).
    pub gyro_noise_density: f64,
    /// Accelerometer noise density (m/s^2/sqrt(Hz)).
    pub accel_noise_density: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        // EuRoC-like values
        Self {
            gyro_noise_density: 1.7e-4,
            accel_noise_density: 2.0e-3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_interpolate() {
        let a = ImuSample::new(1.0, Vector3::new(0.0, 0.0, 1.0), Vector3::zeros());
        let b = ImuSample::new(2.0, Vector3::new(0.0, 0.0, 3.0), Vector3::new(2.0, 0.0, 0.0));
        let mid = a.interpolate(&b, 1.25);
        assert_eq!(mid.timestamp, 1.25);
        assert_relative_eq!(mid.gyro.z, 1.5, epsilon = 1e-12);
        assert_relative_eq!(mid.accel.x, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_is_finite() {
        let mut s = ImuSample::new(0.0, Vector3::zeros(), Vector3::zeros());
        assert!(s.is_finite());
        s.accel.y = f64::NAN;
        assert!(!s.is_finite());
    }
}
