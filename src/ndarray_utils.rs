//! A collection of various utilities needed in this library.
//! The two main groups are `nalgebra` to `ndarray` conversions,
//! inspired by [`nshare`](https://github.com/rust-cv/nshare);
//! and the windowed row operations the normal equations are built from.

use std::ops::Range;

use nalgebra::{Dim, Matrix, Scalar, Storage};
use ndarray::{Array2, ArrayView1, ArrayView2, s};

/// Conversion into an owned two-dimensional `ndarray`.
pub trait IntoNdarray2 {
    /// Resulting array type.
    type Out;

    /// Convert.
    fn into_ndarray2(self) -> Self::Out;
}

impl<N: Scalar> IntoNdarray2 for Array2<N> {
    type Out = Array2<N>;

    fn into_ndarray2(self) -> Self::Out {
        self
    }
}

impl<N: Scalar, R: Dim, C: Dim, S: Storage<N, R, C>> IntoNdarray2 for Matrix<N, R, C, S> {
    type Out = Array2<N>;

    fn into_ndarray2(self) -> Self::Out {
        Array2::from_shape_fn(self.shape(), |(i, j)| self[(i, j)].clone())
    }
}

/// `Σ res[m] / err[m] * deriv[m]` over the rows in `window`.
pub(crate) fn weighted_sum(
    res: ArrayView1<f64>,
    err: ArrayView1<f64>,
    deriv: ArrayView1<f64>,
    window: Range<usize>,
) -> f64 {
    let window = s![window];
    res.slice(window)
        .iter()
        .zip(err.slice(window))
        .zip(deriv.slice(window))
        .map(|((r, e), d)| r / e * d)
        .sum()
}

/// Dot product of two columns of `matrix` restricted to the rows in `window`.
pub(crate) fn column_dot(matrix: ArrayView2<f64>, k: usize, l: usize, window: Range<usize>) -> f64 {
    if window.is_empty() {
        return 0.;
    }
    let rows = s![window.clone(), k];
    let other = s![window, l];
    matrix.slice(rows).dot(&matrix.slice(other))
}
