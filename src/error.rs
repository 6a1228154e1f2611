//! Failure taxonomy of a fit.
//!
//! Every variant terminates the fit that raised it; no partially fitted track is ever returned.
//! [`FitStatistics`] keeps one diagnostic counter per variant so that batch reconstruction can
//! report why tracks were lost.

use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

/// Reasons a fit can fail.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// Propagation between two consecutive states failed in every direction that was tried.
    #[error("Propagation between track states failed in all tried directions (state {state}).")]
    ExtrapolationFailure {
        /// Index of the state that could not be reached, if known.
        state: usize,
    },

    /// The normal-equations matrix is not positive definite.
    #[error("The normal-equations matrix ({size}x{size}) is not positive definite.")]
    MatrixInversionFailure {
        /// Number of fit parameters.
        size: usize,
    },

    /// The iteration cap was reached without convergence.
    #[error("The fit did not converge within {max_iterations} iterations. Last chi2 was {last_chi2:.6e}.")]
    NoConvergence {
        /// Configured iteration cap.
        max_iterations: usize,
        /// Chi-square of the last iteration.
        last_chi2: f64,
    },

    /// An angle update could not be normalized into θ∈[0,π], φ∈[−π,π].
    #[error("Angles out of range after update: phi = {phi}, theta = {theta}.")]
    InvalidAngles {
        /// Azimuth after the failed normalization.
        phi: f64,
        /// Polar angle after the failed normalization.
        theta: f64,
    },

    /// An energy-loss update made the squared momentum non-positive.
    #[error("Energy loss update drives the squared momentum non-positive ({momentum_squared:.6e} MeV^2).")]
    ExtrapolationFailureDueToSmallMomentum {
        /// The offending squared momentum.
        momentum_squared: f64,
    },

    /// Too many outliers, or the degrees of freedom fell below zero while cleaning.
    #[error("Outlier logic failure: {0}")]
    OutlierLogicFailure(String),

    /// Not enough measured components for the number of fitted parameters.
    #[error("Not enough measurements: {ndof} degrees of freedom.")]
    NotEnoughMeasurements {
        /// Degrees of freedom at the point of rejection.
        ndof: i32,
    },

    /// The final chi-square per degree of freedom exceeds the configured cut.
    #[error("Track rejected: chi2/ndof = {chi2_per_dof:.3} exceeds the cut {cut}.")]
    HighChi2 {
        /// Reduced chi-square of the fitted track.
        chi2_per_dof: f64,
        /// Cut that was applied.
        cut: f64,
    },

    /// The fit inputs are inconsistent with the fitter configuration.
    #[error("Invalid fit input: {0}")]
    InvalidInput(String),
}

/// Thread-safe diagnostic counters of a [`Fitter`](crate::Fitter).
#[derive(Debug, Default)]
pub struct FitStatistics {
    attempted: AtomicUsize,
    succeeded: AtomicUsize,
    extrapolation_failures: AtomicUsize,
    matrix_inversion_failures: AtomicUsize,
    not_converged: AtomicUsize,
    invalid_angles: AtomicUsize,
    small_momentum: AtomicUsize,
    outlier_failures: AtomicUsize,
    not_enough_measurements: AtomicUsize,
    high_chi2: AtomicUsize,
    invalid_input: AtomicUsize,
}

/// A plain copy of [`FitStatistics`] at one point in time.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FitStatisticsSnapshot {
    pub attempted: usize,
    pub succeeded: usize,
    pub extrapolation_failures: usize,
    pub matrix_inversion_failures: usize,
    pub not_converged: usize,
    pub invalid_angles: usize,
    pub small_momentum: usize,
    pub outlier_failures: usize,
    pub not_enough_measurements: usize,
    pub high_chi2: usize,
    pub invalid_input: usize,
}

impl FitStatistics {
    pub(crate) fn record_attempt(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, error: &FitError) {
        let counter = match error {
            FitError::ExtrapolationFailure { .. } => &self.extrapolation_failures,
            FitError::MatrixInversionFailure { .. } => &self.matrix_inversion_failures,
            FitError::NoConvergence { .. } => &self.not_converged,
            FitError::InvalidAngles { .. } => &self.invalid_angles,
            FitError::ExtrapolationFailureDueToSmallMomentum { .. } => &self.small_momentum,
            FitError::OutlierLogicFailure(_) => &self.outlier_failures,
            FitError::NotEnoughMeasurements { .. } => &self.not_enough_measurements,
            FitError::HighChi2 { .. } => &self.high_chi2,
            FitError::InvalidInput(_) => &self.invalid_input,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> FitStatisticsSnapshot {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        FitStatisticsSnapshot {
            attempted: load(&self.attempted),
            succeeded: load(&self.succeeded),
            extrapolation_failures: load(&self.extrapolation_failures),
            matrix_inversion_failures: load(&self.matrix_inversion_failures),
            not_converged: load(&self.not_converged),
            invalid_angles: load(&self.invalid_angles),
            small_momentum: load(&self.small_momentum),
            outlier_failures: load(&self.outlier_failures),
            not_enough_measurements: load(&self.not_enough_measurements),
            high_chi2: load(&self.high_chi2),
            invalid_input: load(&self.invalid_input),
        }
    }
}
