//! Error taxonomy for the front end.

use thiserror::Error;

use crate::registration::RegistrationStatus;

/// Errors surfaced by the map, the pre-integrator, the solver and the log reader.
#[derive(Debug, Error)]
pub enum LioError {
    /// Empty or unreadable input, or a record that cannot be used.
    #[error("invalid input: {0}")]
    Input(String),

    /// IMU timestamps that do not strictly increase.
    #[error("timestamp {current} is not after {previous}")]
    TemporalOrder { previous: f64, current: f64 },

    /// Singular normal equations or non-finite covariance propagation.
    #[error("numerical failure: {0}")]
    Numerical(String),

    /// Registration stopped without converging.
    #[error("registration did not converge ({status:?} after {iterations} iterations)")]
    Convergence {
        status: RegistrationStatus,
        iterations: usize,
    },

    /// The run was aborted through a [`crate::CancelToken`].
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LioError {
    /// Errors that abort the current window or iteration but leave the pipeline usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LioError::Input(_)
                | LioError::TemporalOrder { .. }
                | LioError::Numerical(_)
                | LioError::Convergence { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = LioError::TemporalOrder {
            previous: 2.0,
            current: 1.5,
        };
        assert_eq!(err.to_string(), "timestamp 1.5 is not after 2");

        let err = LioError::Input("empty scan".to_string());
        assert_eq!(err.to_string(), "invalid input: empty scan");
    }

    #[test]
    fn test_recoverable() {
        assert!(LioError::Numerical("singular".into()).is_recoverable());
        assert!(!LioError::Cancelled.is_recoverable());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(!LioError::from(io).is_recoverable());
    }
}
