//! Top-level configuration.
//!
//! All sections deserialize with defaults, so a TOML file only needs the keys
//! it changes:
//!
//! ```toml
//! deskew = true
//!
//! [voxel_map]
//! voxel_size = 0.5
//! hash_strategy = { kind = "bounded", bits = 20 }
//! eviction_policy = "farthest_from_position"
//!
//! [registration]
//! residual_kind = "point_to_plane"
//! max_iterations = 20
//!
//! [imu]
//! gravity = [0.0, 0.0, -9.81]
//! ```

use nalgebra::Vector3;
use serde::Deserialize;

use crate::error::{LioError, Result};
use crate::imu::{ImuBias, ImuNoise, GRAVITY};
use crate::registration::RegistrationConfig;
use crate::voxel_map::VoxelMapConfig;

/// Inertial model parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    pub noise: ImuNoise,
    /// Gravity in the map frame (m/s^2).
    pub gravity: [f64; 3],
    /// Initial gyroscope bias (rad/s).
    pub gyro_bias: [f64; 3],
    /// Initial accelerometer bias (m/s^2).
    pub accel_bias: [f64; 3],
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            noise: ImuNoise::default(),
            gravity: [GRAVITY.x, GRAVITY.y, GRAVITY.z],
            gyro_bias: [0.0; 3],
            accel_bias: [0.0; 3],
        }
    }
}

impl ImuConfig {
    pub fn gravity(&self) -> Vector3<f64> {
        Vector3::from(self.gravity)
    }

    pub fn initial_bias(&self) -> ImuBias {
        ImuBias::new(Vector3::from(self.gyro_bias), Vector3::from(self.accel_bias))
    }
}

/// Configuration of the whole front end.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LioConfig {
    pub voxel_map: VoxelMapConfig,
    pub registration: RegistrationConfig,
    pub imu: ImuConfig,
    /// Motion-compensate scans before registration.
    pub deskew: bool,
}

impl Default for LioConfig {
    fn default() -> Self {
        Self {
            voxel_map: VoxelMapConfig::default(),
            registration: RegistrationConfig::default(),
            imu: ImuConfig::default(),
            deskew: true,
        }
    }
}

impl LioConfig {
    /// Check values the individual components cannot check themselves.
    pub fn validate(&self) -> Result<()> {
        let reg = &self.registration;
        if reg.max_iterations == 0 {
            return Err(LioError::Input("max_iterations must be at least 1".into()));
        }
        if reg.chunk_size == 0 {
            return Err(LioError::Input("chunk_size must be at least 1".into()));
        }
        for (name, value) in [
            ("rotation_epsilon", reg.rotation_epsilon),
            ("translation_epsilon", reg.translation_epsilon),
            ("max_correspondence_distance", reg.max_correspondence_distance),
            ("max_condition_number", reg.max_condition_number),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(LioError::Input(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }

        let noise = &self.imu.noise;
        if noise.gyro_noise_density < 0.0 || noise.accel_noise_density < 0.0 {
            return Err(LioError::Input(
                "IMU noise densities must be non-negative".into(),
            ));
        }
        let vectors = [self.imu.gravity, self.imu.gyro_bias, self.imu.accel_bias];
        if vectors.iter().flatten().any(|v| !v.is_finite()) {
            return Err(LioError::Input("IMU vectors must be finite".into()));
        }
        Ok(())
    }
}
