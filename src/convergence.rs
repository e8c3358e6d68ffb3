//! Convergence policy for the fixed-point drivers.
//!
//! The estimators never treat an exhausted iteration budget as success: every driver returns a
//! [`Status`] next to its numbers, and it is up to the caller to decide what an unconverged
//! estimate is worth.

/// When to stop iterating
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Convergence {
    /// Upper bound on the number of sweeps
    pub maximum_iterations: usize,
    /// Stop once the largest absolute change of the tracked free energies falls below this
    pub tolerance: f64,
}

impl Default for Convergence {
    fn default() -> Self {
        Self {
            maximum_iterations: 1000,
            tolerance: 1.0e-10,
        }
    }
}

/// Outcome of a driver loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Status {
    /// The change between two sweeps fell below the tolerance
    Converged {
        /// Number of sweeps performed
        iterations: usize,
        /// Change in the final sweep
        error: f64,
    },
    /// The iteration budget ran out first; the estimate is the last iterate
    MaxIterationsReached {
        /// Number of sweeps performed
        iterations: usize,
        /// Change in the final sweep
        error: f64,
    },
}

impl Status {
    /// Did the estimator meet its tolerance?
    pub fn converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    /// Number of sweeps performed
    pub fn iterations(&self) -> usize {
        match *self {
            Self::Converged { iterations, .. } | Self::MaxIterationsReached { iterations, .. } => {
                iterations
            }
        }
    }

    /// Largest absolute change in the final sweep
    pub fn error(&self) -> f64 {
        match *self {
            Self::Converged { error, .. } | Self::MaxIterationsReached { error, .. } => error,
        }
    }
}

impl Convergence {
    /// Run `sweep` until it reports a change below the tolerance or the budget is spent.
    ///
    /// `sweep` receives the zero-based iteration number and returns the largest absolute change it
    /// made. `label` only names the estimator in log messages.
    pub fn run<F>(&self, label: &str, mut sweep: F) -> Status
    where
        F: FnMut(usize) -> f64,
    {
        let mut error = f64::INFINITY;
        for iteration in 0..self.maximum_iterations {
            error = sweep(iteration);
            log::trace!("{} sweep {}: max |df| = {:e}", label, iteration + 1, error);

            if error < self.tolerance {
                log::info!(
                    "{} converged after {} sweeps (max |df| = {:e})",
                    label,
                    iteration + 1,
                    error
                );
                return Status::Converged {
                    iterations: iteration + 1,
                    error,
                };
            }
        }

        log::warn!(
            "{} did not converge within {} sweeps (max |df| = {:e}, tolerance {:e})",
            label,
            self.maximum_iterations,
            error,
            self.tolerance
        );
        Status::MaxIterationsReached {
            iterations: self.maximum_iterations,
            error,
        }
    }
}

/// Shared builder check for the iteration budget and tolerance fields
pub(crate) fn validate_policy(
    maximum_iterations: Option<usize>,
    tolerance: Option<f64>,
) -> std::result::Result<(), String> {
    if maximum_iterations == Some(0) {
        return Err("maximum_iterations must be at least 1".to_string());
    }
    if let Some(tolerance) = tolerance {
        if !(tolerance > 0.0) {
            return Err(format!("tolerance must be positive (not {})", tolerance));
        }
    }
    Ok(())
}
