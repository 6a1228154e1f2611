//! Normal equations `A x = b` of the linearized least-squares problem.
//!
//! `A` is assembled from the weighted residual derivatives and the scattering priors; `lu` is the
//! copy handed to the solver. Keeping both lets the cleaners apply rank-one corrections to `A`
//! without redoing the whole assembly.

use std::ops::Range;

use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1};

use crate::error::FitError;
use crate::ndarray_utils::{column_dot, weighted_sum};
use crate::trajectory::Trajectory;

/// Residual rows each fit parameter can influence.
///
/// The perigee parameters see every measurement row. A scatterer or brem only sees the rows on
/// the far side of it, as seen from the reference point.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MeasurementWindows {
    windows: Vec<Range<usize>>,
}

impl MeasurementWindows {
    pub(crate) fn new(traj: &Trajectory) -> Self {
        let n_rows = traj.n_measurements();
        let nup = traj.n_upstream_states();
        let rows = traj.measurement_rows();
        let window_of = |index: usize| {
            if index < nup {
                0..rows[index]
            } else {
                rows[index]..n_rows
            }
        };

        let mut windows = vec![0..n_rows; traj.n_perigee_parameters()];
        for index in traj.scatterer_states() {
            windows.push(window_of(index));
            windows.push(window_of(index));
        }
        windows.extend(traj.brem_states().into_iter().map(window_of));
        Self { windows }
    }

    /// Row window of fit parameter `k`.
    pub(crate) fn window(&self, k: usize) -> Range<usize> {
        self.windows[k].clone()
    }

    fn overlap(&self, k: usize, l: usize) -> Range<usize> {
        let (a, b) = (&self.windows[k], &self.windows[l]);
        a.start.max(b.start)..a.end.min(b.end)
    }
}

/// Columns coupled through the energy-balance rows of the brems: q/p and the brem kicks.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BremLayout {
    /// Residual rows of the brems.
    pub rows: (usize, usize),
    /// Whether q/p is a fit parameter.
    pub fits_qoverp: bool,
    /// First brem column.
    pub first_column: usize,
}

impl BremLayout {
    pub(crate) fn new(traj: &Trajectory) -> Self {
        let first = traj.n_measurements();
        Self {
            rows: (first, first + traj.n_brems()),
            fits_qoverp: traj.n_perigee_parameters() == 5,
            first_column: traj.brem_column(0),
        }
    }

    fn couples(&self, k: usize) -> bool {
        (self.fits_qoverp && k == 4) || k >= self.first_column
    }

    fn rows(&self) -> Range<usize> {
        self.rows.0..self.rows.1
    }
}

/// `A`, `b` and the solver copy of `A`.
#[derive(Clone, Debug)]
pub(crate) struct NormalEquations {
    pub a: DMatrix<f64>,
    pub b: DVector<f64>,
    pub lu: DMatrix<f64>,
}

impl NormalEquations {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            a: DMatrix::zeros(n, n),
            b: DVector::zeros(n),
            lu: DMatrix::zeros(n, n),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.b.len()
    }

    /// Refresh the solver copy from `A`.
    pub(crate) fn sync(&mut self) {
        self.lu.copy_from(&self.a);
    }

    /// Solve `lu x = b`.
    pub(crate) fn solve(&self) -> Result<DVector<f64>, FitError> {
        let cholesky = Cholesky::new(self.lu.clone()).ok_or(FitError::MatrixInversionFailure {
            size: self.size(),
        })?;
        Ok(cholesky.solve(&self.b))
    }

    /// `A⁻¹`, the covariance of the fit parameters.
    pub(crate) fn covariance(&self) -> Result<DMatrix<f64>, FitError> {
        let cholesky = Cholesky::new(self.a.clone()).ok_or(FitError::MatrixInversionFailure {
            size: self.size(),
        })?;
        Ok(cholesky.inverse())
    }

    /// Add the measurement contributions to `b`.
    pub(crate) fn accumulate_gradient(
        &mut self,
        res: ArrayView1<f64>,
        err: ArrayView1<f64>,
        wd: ArrayView2<f64>,
        windows: &MeasurementWindows,
        brems: BremLayout,
    ) {
        for k in 0..self.size() {
            let column = wd.column(k);
            let mut sum = weighted_sum(res, err, column, windows.window(k));
            if brems.couples(k) {
                sum += weighted_sum(res, err, column, brems.rows());
            }
            self.b[k] += sum;
        }
    }

    /// Rebuild `A` from the weighted derivatives and the scattering priors
    /// `(phi column, sigma phi, sigma theta)`.
    pub(crate) fn assemble(
        &mut self,
        wd: ArrayView2<f64>,
        windows: &MeasurementWindows,
        brems: BremLayout,
        priors: &[(usize, f64, f64)],
    ) {
        let n = self.size();
        for k in 0..n {
            for l in k..n {
                let value = column_dot(wd, k, l, windows.overlap(k, l));
                self.a[(k, l)] = value;
                self.a[(l, k)] = value;
            }
        }
        for &(col, sigma_phi, sigma_theta) in priors {
            self.a[(col, col)] += 1. / (sigma_phi * sigma_phi);
            self.a[(col + 1, col + 1)] += 1. / (sigma_theta * sigma_theta);
        }

        let coupled: Vec<usize> = (0..n).filter(|k| brems.couples(*k)).collect();
        for row in brems.rows() {
            for (i, &k) in coupled.iter().enumerate() {
                for &l in &coupled[i..] {
                    let value = wd[[row, k]] * wd[[row, l]];
                    self.a[(k, l)] += value;
                    if k != l {
                        self.a[(l, k)] += value;
                    }
                }
            }
        }
    }

    /// Take a residual row out of the problem and zero its derivatives.
    pub(crate) fn remove_row(&mut self, mut wd: ArrayViewMut1<f64>, res: f64, err: f64) {
        let n = self.size();
        for i in 0..n {
            self.b[i] -= res * wd[i] / err;
            for j in i..n {
                let value = wd[i] * wd[j];
                self.a[(i, j)] -= value;
                if i != j {
                    self.a[(j, i)] -= value;
                }
            }
        }
        wd.fill(0.);
    }

    /// Swap the residual and error of a row, rescaling its derivatives.
    ///
    /// `phi_weights` lists `(column, weight)` of inflated scatterer diagonals, so that the
    /// correction on those entries carries the same inflation.
    pub(crate) fn rescale_row(
        &mut self,
        mut wd: ArrayViewMut1<f64>,
        old_res: f64,
        new_res: f64,
        old_err: f64,
        new_err: f64,
        phi_weights: &[(usize, f64)],
    ) {
        let n = self.size();
        let ratio = old_err * old_err / (new_err * new_err) - 1.;
        for i in 0..n {
            self.b[i] -= wd[i] * (old_res / old_err - new_res * old_err / (new_err * new_err));
            for j in i..n {
                let value = wd[i] * wd[j] * ratio;
                self.a[(i, j)] += value;
                if i != j {
                    self.a[(j, i)] += value;
                }
            }
        }
        for &(col, weight) in phi_weights {
            self.a[(col, col)] += wd[col] * wd[col] * ratio * (weight - 1.);
        }
        wd.mapv_inplace(|d| d * old_err / new_err);
    }
}
