//! Inertial measurements and pre-integration.

pub mod preintegration;
pub mod sample;

pub use preintegration::{BiasJacobians, Matrix9, PreintegratedDelta, Preintegrator};
pub use sample::{ImuBias, ImuNoise, ImuSample, GRAVITY};
