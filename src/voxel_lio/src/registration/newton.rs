//! Gauss-Newton step for the registration normal equations.
//!
//! The step solves `(J^T J) d = -J^T r`. `J^T J` is symmetric positive
//! semi-definite, so Cholesky is the primary solver and singularity is judged
//! from the eigenvalue spread before solving.

use nalgebra::{Matrix6, Vector6};

/// Solve the normal equations.
///
/// # Arguments
/// * `hessian` - Approximate Hessian `J^T J` (6x6)
/// * `gradient` - Gradient `J^T r` (6x1)
/// * `max_condition_number` - Systems above this condition number are rejected
///
/// # Returns
/// The step `[dt, dtheta]`, or `None` if the system is singular.
pub fn gauss_newton_step(
    hessian: &Matrix6<f64>,
    gradient: &Vector6<f64>,
    max_condition_number: f64,
) -> Option<Vector6<f64>> {
    if condition_number(hessian) > max_condition_number {
        return None;
    }
    let chol = hessian.cholesky()?;
    let step = chol.solve(&(-gradient));
    step.iter().all(|v| v.is_finite()).then_some(step)
}

/// Condition number from the symmetric eigenvalues.
///
/// # Returns
/// `max_eig / min_eig`, or `f64::INFINITY` when the smallest eigenvalue is
/// not positive.
pub fn condition_number(hessian: &Matrix6<f64>) -> f64 {
    let eigen = hessian.symmetric_eigen();
    let max_ev = eigen.eigenvalues.max();
    let min_ev = eigen.eigenvalues.min();

    if min_ev.is_nan() || min_ev <= 1e-15 * max_ev.abs().max(1.0) {
        f64::INFINITY
    } else {
        max_ev / min_ev
    }
}

/// Inverse of a symmetric positive definite matrix, `None` otherwise.
pub fn spd_inverse(matrix: &Matrix6<f64>) -> Option<Matrix6<f64>> {
    matrix.cholesky().map(|c| c.inverse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_step_identity() {
        // For H = I, d = -g
        let gradient = Vector6::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0);
        let step = gauss_newton_step(&Matrix6::identity(), &gradient, 1e12).unwrap();
        assert_relative_eq!(step, -gradient, epsilon = 1e-12);
    }

    #[test]
    fn test_step_scaled() {
        let gradient = Vector6::new(2.0, 4.0, 6.0, 8.0, 10.0, 12.0);
        let step = gauss_newton_step(&(Matrix6::identity() * 2.0), &gradient, 1e12).unwrap();
        assert_relative_eq!(step, -gradient / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_step_general_spd() {
        let gradient = Vector6::new(1.0, 2.0, 3.0, 0.1, 0.2, 0.3);
        let a = Matrix6::from_fn(|i, j| if i == j { 1.0 + i as f64 * 0.2 } else { 0.1 });
        let hessian = a.transpose() * a + Matrix6::identity();

        let step = gauss_newton_step(&hessian, &gradient, 1e12).unwrap();
        assert_relative_eq!(hessian * step, -gradient, epsilon = 1e-9);
    }

    #[test]
    fn test_singular_rejected() {
        let gradient = Vector6::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0);
        assert!(gauss_newton_step(&Matrix6::zeros(), &gradient, 1e12).is_none());

        let mut rank_deficient = Matrix6::identity();
        rank_deficient[(5, 5)] = 0.0;
        assert!(gauss_newton_step(&rank_deficient, &gradient, 1e12).is_none());

        let mut ill = Matrix6::identity();
        ill[(5, 5)] = 1e-9;
        assert!(gauss_newton_step(&ill, &gradient, 1e6).is_none());
        assert!(gauss_newton_step(&ill, &gradient, 1e12).is_some());
    }

    #[test]
    fn test_condition_number() {
        assert_relative_eq!(condition_number(&Matrix6::identity()), 1.0, epsilon = 1e-10);
        assert_relative_eq!(
            condition_number(&(Matrix6::identity() * 10.0)),
            1.0,
            epsilon = 1e-10
        );

        let mut ill = Matrix6::identity();
        ill[(0, 0)] = 1e6;
        assert_relative_eq!(condition_number(&ill), 1e6, epsilon = 1e-3);

        assert_eq!(condition_number(&Matrix6::zeros()), f64::INFINITY);
    }

    #[test]
    fn test_spd_inverse() {
        let m = Matrix6::identity() * 4.0;
        assert_relative_eq!(spd_inverse(&m).unwrap(), Matrix6::identity() * 0.25);
        assert!(spd_inverse(&Matrix6::zeros()).is_none());
    }
}
