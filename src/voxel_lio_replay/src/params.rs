//! Replay parameters
//!
//! Front-end settings and sensor point filtering are read from one TOML file.
//! Front-end keys sit at the top level; filtering goes in `[sensor_points]`.
//! Command-line flags override file values.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use voxel_lio::LioConfig;

use crate::pointcloud::PointFilterParams;

/// All replay parameters
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplayParams {
    #[serde(flatten)]
    pub lio: LioConfig,
    pub sensor_points: PointFilterParams,
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub voxel_size: Option<f64>,
    pub max_iterations: Option<usize>,
    pub max_resident_cells: Option<usize>,
    pub no_deskew: bool,
}

impl ReplayParams {
    /// Load parameters from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(voxel_size) = overrides.voxel_size {
            self.lio.voxel_map.voxel_size = voxel_size;
        }
        if let Some(max_iterations) = overrides.max_iterations {
            self.lio.registration.max_iterations = max_iterations;
        }
        if let Some(max_resident_cells) = overrides.max_resident_cells {
            self.lio.voxel_map.max_resident_cells = max_resident_cells;
        }
        if overrides.no_deskew {
            self.lio.deskew = false;
        }
    }
}
