//! Five-parameter track state on a surface.

use std::sync::Arc;

use nalgebra::{Matrix5, Vector3, Vector5};

use crate::geometry::{Surface, direction};

/// Index of the first local coordinate.
pub const LOC1: usize = 0;
/// Index of the second local coordinate.
pub const LOC2: usize = 1;
/// Index of the azimuth.
pub const PHI: usize = 2;
/// Index of the polar angle.
pub const THETA: usize = 3;
/// Index of the signed inverse momentum (1/MeV).
pub const QOVERP: usize = 4;

/// Scale between q/p in 1/MeV and the fitted curvature parameter (1/GeV).
pub(crate) const QOP_SCALE: f64 = 0.001;

/// Track parameters `(loc1, loc2, phi, theta, q/p)` on a surface, with optional covariance.
///
/// Parameters are immutable once built and replaced wholesale when the fit updates them.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackParameters {
    surface: Arc<Surface>,
    values: Vector5<f64>,
    covariance: Option<Matrix5<f64>>,
}

impl TrackParameters {
    /// Create parameters without covariance.
    pub fn new(surface: Arc<Surface>, values: Vector5<f64>) -> Self {
        Self {
            surface,
            values,
            covariance: None,
        }
    }

    /// Create parameters from a global position and direction.
    pub fn from_global(
        surface: Arc<Surface>,
        position: &Vector3<f64>,
        phi: f64,
        theta: f64,
        qoverp: f64,
    ) -> Self {
        let dir = direction(phi, theta);
        let (loc1, loc2) = surface.global_to_local(position, &dir);
        Self::new(surface, Vector5::new(loc1, loc2, phi, theta, qoverp))
    }

    /// Attach a covariance.
    pub fn with_covariance(mut self, covariance: Matrix5<f64>) -> Self {
        self.covariance = Some(covariance);
        self
    }

    /// Copy with other parameter values and no covariance.
    pub fn with_values(&self, values: Vector5<f64>) -> Self {
        Self::new(self.surface.clone(), values)
    }

    /// Surface the parameters are expressed on.
    pub fn surface(&self) -> &Arc<Surface> {
        &self.surface
    }

    /// Parameter vector.
    pub fn values(&self) -> &Vector5<f64> {
        &self.values
    }

    /// Covariance, if known.
    pub fn covariance(&self) -> Option<&Matrix5<f64>> {
        self.covariance.as_ref()
    }

    /// Azimuth.
    pub fn phi(&self) -> f64 {
        self.values[PHI]
    }

    /// Polar angle.
    pub fn theta(&self) -> f64 {
        self.values[THETA]
    }

    /// Signed inverse momentum in 1/MeV.
    pub fn qoverp(&self) -> f64 {
        self.values[QOVERP]
    }

    /// Unit direction.
    pub fn direction(&self) -> Vector3<f64> {
        direction(self.phi(), self.theta())
    }

    /// Global position.
    pub fn position(&self) -> Vector3<f64> {
        self.surface
            .local_to_global(self.values[LOC1], self.values[LOC2], &self.direction())
    }

    /// Momentum magnitude in MeV; infinite for a straight track.
    pub fn momentum(&self) -> f64 {
        1. / self.qoverp().abs()
    }

    /// Charge sign (zero for a straight track).
    pub fn charge(&self) -> f64 {
        if self.qoverp() == 0. {
            0.
        } else {
            self.qoverp().signum()
        }
    }
}

/// Chi-square and degrees of freedom of a fit or of a single state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FitQuality {
    /// Chi-square.
    pub chi2: f64,
    /// Degrees of freedom.
    pub ndof: i32,
}

impl FitQuality {
    /// Create a fit quality.
    pub fn new(chi2: f64, ndof: i32) -> Self {
        Self { chi2, ndof }
    }

    /// Reduced chi-square; zero without degrees of freedom.
    pub fn chi2_per_dof(&self) -> f64 {
        if self.ndof > 0 {
            self.chi2 / self.ndof as f64
        } else {
            0.
        }
    }
}

/// Clamp |q/p| (1/GeV) to the range the energy-balance residual can handle, keeping the sign.
pub(crate) fn limit_inverse_p(qoverp: f64) -> f64 {
    const MAX_P: f64 = 100. * 10e6;
    const MIN_P: f64 = 1e-3;
    let magnitude = qoverp.abs().clamp(1. / MAX_P, 1. / MIN_P);
    magnitude.copysign(qoverp)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::geometry::SurfaceId;

    #[test]
    fn perigee_position() {
        let perigee = Arc::new(Surface::perigee(Vector3::zeros()));
        let phi = 0.4;
        let params = TrackParameters::new(perigee, Vector5::new(2., 5., phi, 1., 1e-3));
        let expected = Vector3::new(-2. * phi.sin(), 2. * phi.cos(), 5.);
        assert_abs_diff_eq!(params.position(), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(params.momentum(), 1000., epsilon = 1e-9);
        assert_eq!(params.charge(), 1.);
    }

    #[test]
    fn from_global_round_trip() {
        let plane = Arc::new(Surface::plane(
            SurfaceId(3),
            Vector3::new(0., 0., 300.),
            Vector3::z(),
            Vector3::x(),
        ));
        let pos = Vector3::new(4., -7., 300.);
        let params = TrackParameters::from_global(plane, &pos, 0.2, 0.3, -2e-3);
        assert_abs_diff_eq!(params.position(), pos, epsilon = 1e-12);
        assert_eq!(params.charge(), -1.);
    }

    #[test]
    fn inverse_momentum_is_clamped() {
        assert_eq!(limit_inverse_p(5e3), 1e3);
        assert_eq!(limit_inverse_p(-5e3), -1e3);
        assert_abs_diff_eq!(limit_inverse_p(1e-12), 1e-9, epsilon = 1e-20);
        assert_eq!(limit_inverse_p(0.5), 0.5);
    }

    #[test]
    fn reduced_chi2() {
        assert_eq!(FitQuality::new(10., 4).chi2_per_dof(), 2.5);
        assert_eq!(FitQuality::new(10., 0).chi2_per_dof(), 0.);
    }
}
