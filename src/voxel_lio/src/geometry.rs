//! SO(3) helpers shared by registration and pre-integration.
//!
//! Conventions follow Forster et al., "On-Manifold Preintegration for
//! Real-Time Visual-Inertial Odometry" (T-RO 2017).

use nalgebra::{Matrix3, Vector3};

/// Below this angle the closed forms switch to their Taylor expansions.
const SMALL_ANGLE: f64 = 1e-6;

/// Skew-symmetric matrix `[v]x` with `[v]x * u = v x u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Right Jacobian of SO(3).
///
/// ```text
/// Jr(phi) = I - (1 - cos t)/t^2 [phi]x + (t - sin t)/t^3 [phi]x^2,  t = |phi|
/// ```
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let k = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * k;
    }
    let theta_sq = theta * theta;
    Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * k
        + ((theta - theta.sin()) / (theta_sq * theta)) * k * k
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    #[test]
    fn test_skew_is_cross_product() {
        let v = Vector3::new(0.3, -1.2, 2.0);
        let u = Vector3::new(-4.0, 0.5, 1.0);
        assert_relative_eq!(skew(&v) * u, v.cross(&u), epsilon = 1e-12);
        assert_relative_eq!(skew(&v), -skew(&v).transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_first_order() {
        // Exp(phi + d) ~= Exp(phi) Exp(Jr(phi) d)
        let phi = Vector3::new(0.3, -0.2, 0.5);
        let d = Vector3::new(1e-6, -2e-6, 1.5e-6);
        let lhs = Rotation3::new(phi + d);
        let rhs = Rotation3::new(phi) * Rotation3::new(right_jacobian(&phi) * d);
        assert_relative_eq!(lhs.into_inner(), rhs.into_inner(), epsilon = 1e-10);
    }

    #[test]
    fn test_right_jacobian_small_angle() {
        let phi = Vector3::new(1e-8, -1e-8, 2e-8);
        assert_relative_eq!(right_jacobian(&phi), Matrix3::identity(), epsilon = 1e-7);
        assert_relative_eq!(
            right_jacobian(&Vector3::zeros()),
            Matrix3::identity(),
            epsilon = 1e-15
        );
    }
}
