//! On-manifold IMU pre-integration.
//!
//! Integrates bias-corrected gyro/accel samples between two scan times into a
//! relative motion `(dR, dv, dp)` that does not depend on the start state.
//! Gravity is not integrated; it enters in [`PreintegratedDelta::predict`].
//!
//! Per segment of length `dt` with midpoint measurements `w`, `a`:
//!
//! ```text
//! dp <- dp + dv dt + 1/2 dR a dt^2
//! dv <- dv + dR a dt
//! dR <- dR Exp(w dt)
//! ```
//!
//! The 9x9 covariance over `[dtheta, dv, dp]` and the first-order bias
//! Jacobians are propagated alongside (Forster et al., T-RO 2017).

use nalgebra::{Isometry3, Matrix3, SMatrix, Translation3, UnitQuaternion, Vector3};
use tracing::{debug, trace};

use super::sample::{ImuBias, ImuNoise, ImuSample};
use crate::error::{LioError, Result};
use crate::geometry::{right_jacobian, skew};

/// 9x9 covariance over the pre-integrated error state `[dtheta, dv, dp]`.
pub type Matrix9 = SMatrix<f64, 9, 9>;

/// 9x3 noise input matrix.
type Matrix9x3 = SMatrix<f64, 9, 3>;

/// First-order sensitivities of the delta to the bias it was linearized at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiasJacobians {
    pub rot_gyro: Matrix3<f64>,
    pub vel_gyro: Matrix3<f64>,
    pub vel_accel: Matrix3<f64>,
    pub pos_gyro: Matrix3<f64>,
    pub pos_accel: Matrix3<f64>,
}

impl BiasJacobians {
    fn zeros() -> Self {
        Self {
            rot_gyro: Matrix3::zeros(),
            vel_gyro: Matrix3::zeros(),
            vel_accel: Matrix3::zeros(),
            pos_gyro: Matrix3::zeros(),
            pos_accel: Matrix3::zeros(),
        }
    }
}

/// Relative motion integrated over one window.
#[derive(Debug, Clone, PartialEq)]
pub struct PreintegratedDelta {
    /// Integrated time (s).
    pub dt: f64,
    pub delta_rotation: UnitQuaternion<f64>,
    pub delta_velocity: Vector3<f64>,
    pub delta_position: Vector3<f64>,
    /// Covariance over `[dtheta, dv, dp]`.
    pub covariance: Matrix9,
    pub jacobians: BiasJacobians,
    /// Bias the delta is linearized at.
    pub bias: ImuBias,
    /// Samples inside the window.
    pub sample_count: usize,
}

impl PreintegratedDelta {
    /// Zero-length delta.
    pub fn identity(bias: ImuBias) -> Self {
        Self {
            dt: 0.0,
            delta_rotation: UnitQuaternion::identity(),
            delta_velocity: Vector3::zeros(),
            delta_position: Vector3::zeros(),
            covariance: Matrix9::zeros(),
            jacobians: BiasJacobians::zeros(),
            bias,
            sample_count: 0,
        }
    }

    fn is_finite(&self) -> bool {
        self.delta_rotation.coords.iter().all(|v| v.is_finite())
            && self.delta_velocity.iter().all(|v| v.is_finite())
            && self.delta_position.iter().all(|v| v.is_finite())
            && self.covariance.iter().all(|v| v.is_finite())
    }

    /// Integrate one segment of constant raw measurements.
    fn integrate_segment(
        &mut self,
        gyro: &Vector3<f64>,
        accel: &Vector3<f64>,
        dt: f64,
        noise: &ImuNoise,
    ) {
        let omega = gyro - self.bias.gyro;
        let acc = accel - self.bias.accel;
        let r = self.delta_rotation.to_rotation_matrix().into_inner();
        let phi = omega * dt;
        let step = UnitQuaternion::from_scaled_axis(phi);
        let step_t = step.to_rotation_matrix().into_inner().transpose();
        let jr = right_jacobian(&phi);
        let r_acc_hat = r * skew(&acc);
        let dt2 = dt * dt;

        let mut a = Matrix9::identity();
        a.fixed_view_mut::<3, 3>(0, 0).copy_from(&step_t);
        a.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-r_acc_hat * dt));
        a.fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-0.5 * r_acc_hat * dt2));
        a.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt));

        let mut b_gyro = Matrix9x3::zeros();
        b_gyro.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr * dt));
        let mut b_accel = Matrix9x3::zeros();
        b_accel.fixed_view_mut::<3, 3>(3, 0).copy_from(&(r * dt));
        b_accel.fixed_view_mut::<3, 3>(6, 0).copy_from(&(0.5 * r * dt2));

        // Continuous densities to discrete variances
        let gyro_var = noise.gyro_noise_density.powi(2) / dt;
        let accel_var = noise.accel_noise_density.powi(2) / dt;
        self.covariance = a * self.covariance * a.transpose()
            + b_gyro * b_gyro.transpose() * gyro_var
            + b_accel * b_accel.transpose() * accel_var;

        // Jacobians use the rotation before this segment
        let j = &mut self.jacobians;
        j.pos_accel += j.vel_accel * dt - 0.5 * r * dt2;
        j.pos_gyro += j.vel_gyro * dt - 0.5 * r_acc_hat * j.rot_gyro * dt2;
        j.vel_accel -= r * dt;
        j.vel_gyro -= r_acc_hat * j.rot_gyro * dt;
        j.rot_gyro = step_t * j.rot_gyro - jr * dt;

        self.delta_position += self.delta_velocity * dt + 0.5 * r * acc * dt2;
        self.delta_velocity += r * acc * dt;
        self.delta_rotation = self.delta_rotation * step;
        self.delta_rotation.renormalize_fast();
        self.dt += dt;
    }

    /// Re-linearize for a new bias without re-integrating.
    ///
    /// First-order update through the bias Jacobians. Covariance and
    /// Jacobians are kept.
    pub fn corrected(&self, bias: &ImuBias) -> Self {
        let dbg = bias.gyro - self.bias.gyro;
        let dba = bias.accel - self.bias.accel;
        let j = &self.jacobians;

        Self {
            delta_rotation: self.delta_rotation
                * UnitQuaternion::from_scaled_axis(j.rot_gyro * dbg),
            delta_velocity: self.delta_velocity + j.vel_gyro * dbg + j.vel_accel * dba,
            delta_position: self.delta_position + j.pos_gyro * dbg + j.pos_accel * dba,
            bias: *bias,
            ..self.clone()
        }
    }

    /// Concatenate with the delta of the window that immediately follows.
    ///
    /// `next` is first re-linearized at this delta's bias.
    pub fn compose(&self, next: &PreintegratedDelta) -> Self {
        let next = if next.bias == self.bias {
            next.clone()
        } else {
            next.corrected(&self.bias)
        };

        let r1 = self.delta_rotation.to_rotation_matrix().into_inner();
        let r2_t = next
            .delta_rotation
            .to_rotation_matrix()
            .into_inner()
            .transpose();
        let r1_v2_hat = r1 * skew(&next.delta_velocity);
        let r1_p2_hat = r1 * skew(&next.delta_position);
        let dt2 = next.dt;

        // Sensitivity of the composed error to each window's error
        let mut a1 = Matrix9::identity();
        a1.fixed_view_mut::<3, 3>(0, 0).copy_from(&r2_t);
        a1.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-r1_v2_hat));
        a1.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-r1_p2_hat));
        a1.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt2));

        let mut a2 = Matrix9::identity();
        a2.fixed_view_mut::<3, 3>(3, 3).copy_from(&r1);
        a2.fixed_view_mut::<3, 3>(6, 6).copy_from(&r1);

        let j1 = &self.jacobians;
        let j2 = &next.jacobians;
        let jacobians = BiasJacobians {
            rot_gyro: r2_t * j1.rot_gyro + j2.rot_gyro,
            vel_gyro: j1.vel_gyro - r1_v2_hat * j1.rot_gyro + r1 * j2.vel_gyro,
            vel_accel: j1.vel_accel + r1 * j2.vel_accel,
            pos_gyro: j1.pos_gyro + j1.vel_gyro * dt2 - r1_p2_hat * j1.rot_gyro
                + r1 * j2.pos_gyro,
            pos_accel: j1.pos_accel + j1.vel_accel * dt2 + r1 * j2.pos_accel,
        };

        Self {
            dt: self.dt + next.dt,
            delta_rotation: self.delta_rotation * next.delta_rotation,
            delta_velocity: self.delta_velocity + r1 * next.delta_velocity,
            delta_position: self.delta_position
                + self.delta_velocity * dt2
                + r1 * next.delta_position,
            covariance: a1 * self.covariance * a1.transpose()
                + a2 * next.covariance * a2.transpose(),
            jacobians,
            bias: self.bias,
            sample_count: self.sample_count + next.sample_count,
        }
    }

    /// Predict the navigation state at the end of the window.
    ///
    /// ```text
    /// R' = R dR
    /// v' = v + g dt + R dv
    /// p' = p + v dt + 1/2 g dt^2 + R dp
    /// ```
    ///
    /// # Returns
    /// The predicted pose and velocity.
    pub fn predict(
        &self,
        pose: &Isometry3<f64>,
        velocity: &Vector3<f64>,
        gravity: &Vector3<f64>,
    ) -> (Isometry3<f64>, Vector3<f64>) {
        let rotation = pose.rotation;
        let dt = self.dt;
        let new_velocity = velocity + gravity * dt + rotation * self.delta_velocity;
        let new_position = pose.translation.vector
            + velocity * dt
            + 0.5 * gravity * dt * dt
            + rotation * self.delta_position;
        (
            Isometry3::from_parts(
                Translation3::from(new_position),
                rotation * self.delta_rotation,
            ),
            new_velocity,
        )
    }
}

/// Windowed pre-integrator.
///
/// A window covers `[t_start, t_end]`. Samples at or before `t_start` only
/// become the carry-over sample used to interpolate the measurement at the
/// window edge. The last sample is held until `t_end`.
#[derive(Debug, Clone)]
pub struct Preintegrator {
    noise: ImuNoise,
    t_start: f64,
    /// Time up to which the window has been integrated.
    cursor: f64,
    last: Option<ImuSample>,
    delta: PreintegratedDelta,
}

impl Preintegrator {
    /// Open a window at `t_start`.
    pub fn new(t_start: f64, bias: ImuBias, noise: ImuNoise) -> Self {
        Self {
            noise,
            t_start,
            cursor: t_start,
            last: None,
            delta: PreintegratedDelta::identity(bias),
        }
    }

    /// Open a window at `t_start` with a sample carried over from earlier data.
    pub fn with_carry_over(t_start: f64, bias: ImuBias, noise: ImuNoise, last: ImuSample) -> Self {
        Self {
            last: Some(last),
            ..Self::new(t_start, bias, noise)
        }
    }

    /// Start of the open window.
    pub fn window_start(&self) -> f64 {
        self.t_start
    }

    /// Most recent accepted sample.
    pub fn last_sample(&self) -> Option<&ImuSample> {
        self.last.as_ref()
    }

    /// Delta integrated so far in the open window.
    pub fn current(&self) -> &PreintegratedDelta {
        &self.delta
    }

    /// Bias used for integration.
    pub fn bias(&self) -> &ImuBias {
        &self.delta.bias
    }

    /// Switch the integration bias. The part already integrated is
    /// re-linearized to first order.
    pub fn set_bias(&mut self, bias: ImuBias) {
        if bias != self.delta.bias {
            self.delta = self.delta.corrected(&bias);
        }
    }

    /// Integrate a sample.
    ///
    /// # Errors
    /// * [`LioError::Input`] for non-finite values
    /// * [`LioError::TemporalOrder`] unless the timestamp is strictly after
    ///   the previous sample
    /// * [`LioError::Numerical`] if propagation produces non-finite values
    ///
    /// A rejected sample leaves the window unchanged.
    pub fn push(&mut self, sample: ImuSample) -> Result<()> {
        if !sample.is_finite() {
            return Err(LioError::Input(format!(
                "non-finite IMU sample at {}",
                sample.timestamp
            )));
        }
        if let Some(last) = &self.last {
            if sample.timestamp <= last.timestamp {
                return Err(LioError::TemporalOrder {
                    previous: last.timestamp,
                    current: sample.timestamp,
                });
            }
        }

        if sample.timestamp <= self.t_start {
            self.last = Some(sample);
            return Ok(());
        }

        let start = match self.last {
            Some(prev) if prev.timestamp < self.cursor => prev.interpolate(&sample, self.cursor),
            Some(prev) => prev,
            // Nothing earlier: hold the first sample back to the window start
            None => sample.held_at(self.cursor),
        };
        self.integrate(&start, &sample)?;

        self.delta.sample_count += 1;
        self.cursor = sample.timestamp;
        self.last = Some(sample);
        trace!(t = sample.timestamp, "IMU sample integrated");
        Ok(())
    }

    /// Close the window at `t_end` and open the next one there.
    ///
    /// # Errors
    /// * [`LioError::TemporalOrder`] if `t_end` precedes integrated data; the
    ///   window stays open
    /// * [`LioError::Input`] for a window of nonzero length without samples;
    ///   the next window still opens at `t_end`
    /// * [`LioError::Numerical`] if propagation produces non-finite values
    pub fn close(&mut self, t_end: f64) -> Result<PreintegratedDelta> {
        if !t_end.is_finite() {
            return Err(LioError::Input("non-finite window end".to_string()));
        }
        if t_end < self.cursor {
            return Err(LioError::TemporalOrder {
                previous: self.cursor,
                current: t_end,
            });
        }

        if t_end > self.t_start {
            let Some(last) = self.last.filter(|_| self.delta.sample_count > 0) else {
                let t_start = self.t_start;
                self.reopen(t_end);
                return Err(LioError::Input(format!(
                    "no IMU samples in window [{t_start}, {t_end}]"
                )));
            };
            if t_end > self.cursor {
                self.integrate(&last.held_at(self.cursor), &last.held_at(t_end))?;
                self.cursor = t_end;
            }
        }

        let delta = self.reopen(t_end);
        debug!(
            dt = delta.dt,
            samples = delta.sample_count,
            "IMU window closed"
        );
        Ok(delta)
    }

    fn reopen(&mut self, t: f64) -> PreintegratedDelta {
        self.t_start = t;
        self.cursor = t;
        let bias = self.delta.bias;
        std::mem::replace(&mut self.delta, PreintegratedDelta::identity(bias))
    }

    fn integrate(&mut self, from: &ImuSample, to: &ImuSample) -> Result<()> {
        let dt = to.timestamp - from.timestamp;
        if dt <= 0.0 {
            return Ok(());
        }
        let gyro = 0.5 * (from.gyro + to.gyro);
        let accel = 0.5 * (from.accel + to.accel);

        let mut next = self.delta.clone();
        next.integrate_segment(&gyro, &accel, dt, &self.noise);
        if !next.is_finite() {
            return Err(LioError::Numerical(format!(
                "non-finite pre-integration at t = {}",
                to.timestamp
            )));
        }
        self.delta = next;
        Ok(())
    }
}
