//! Transport of track parameters between surfaces.
//!
//! The fitter only talks to the [`Propagator`] trait. [`HelixPropagator`] is a constant-field
//! implementation; with zero field it degenerates to straight lines and provides an analytic
//! plane-to-plane Jacobian. Whenever no Jacobian is returned the fitter differentiates numerically.

use std::sync::Arc;

use nalgebra::{Matrix5, Vector3, Vector5};

use crate::geometry::{Surface, SurfaceShape, angles, direction};
use crate::parameters::{LOC1, LOC2, PHI, QOVERP, THETA, TrackParameters};

/// Curvature constant: κ[1/mm] = C · B[T] · q/p[1/MeV].
const C_LIGHT: f64 = 0.299792458;
const MAX_NEWTON_STEPS: usize = 25;
const PATH_TOLERANCE: f64 = 1e-9;
/// Negative path lengths this small still count as "along".
const DIRECTION_TOLERANCE: f64 = 1e-6;

/// Requested direction of a propagation relative to the momentum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropDirection {
    /// Along the momentum.
    Along,
    /// Against the momentum.
    Opposite,
    /// Whichever reaches the surface.
    Any,
}

impl PropDirection {
    /// The opposite direction; `Any` stays `Any`.
    pub fn reversed(self) -> Self {
        match self {
            Self::Along => Self::Opposite,
            Self::Opposite => Self::Along,
            Self::Any => Self::Any,
        }
    }

    fn accepts(self, path: f64) -> bool {
        match self {
            Self::Along => path >= -DIRECTION_TOLERANCE,
            Self::Opposite => path <= DIRECTION_TOLERANCE,
            Self::Any => true,
        }
    }
}

/// Result of a successful propagation.
#[derive(Clone, Debug)]
pub struct Propagation {
    /// Parameters on the target surface.
    pub parameters: TrackParameters,
    /// Transport Jacobian d(target)/d(start), if the propagator can compute it.
    pub jacobian: Option<Matrix5<f64>>,
    /// Signed path length.
    pub path_length: f64,
}

/// Point-to-surface transport.
pub trait Propagator {
    /// Propagate `params` to `surface`. Returns `None` if the surface is not reached in the
    /// requested direction.
    fn propagate(
        &self,
        params: &TrackParameters,
        surface: &Arc<Surface>,
        direction: PropDirection,
        with_jacobian: bool,
    ) -> Option<Propagation>;

    /// Whether the magnetic field bends tracks, i.e. whether q/p is a fit parameter.
    fn field_is_on(&self) -> bool;
}

/// Helix propagator in a homogeneous magnetic field.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HelixPropagator {
    field: Vector3<f64>,
}

impl Default for HelixPropagator {
    fn default() -> Self {
        Self::straight()
    }
}

impl HelixPropagator {
    /// Field vector in Tesla.
    pub fn new(field: Vector3<f64>) -> Self {
        Self { field }
    }

    /// Solenoidal field along z.
    pub fn solenoid(bz: f64) -> Self {
        Self::new(Vector3::new(0., 0., bz))
    }

    /// No field; tracks are straight lines.
    pub fn straight() -> Self {
        Self::new(Vector3::zeros())
    }

    /// Field vector in Tesla.
    pub fn field(&self) -> &Vector3<f64> {
        &self.field
    }

    fn helix(&self, params: &TrackParameters) -> Helix {
        let bmag = self.field.norm();
        let (b, kappa) = if bmag > 0. {
            (self.field / bmag, C_LIGHT * bmag * params.qoverp())
        } else {
            (Vector3::z(), 0.)
        };
        Helix {
            pos: params.position(),
            dir: params.direction(),
            b,
            kappa,
        }
    }
}

/// Helix through `pos` with unit tangent `dir`; `dt/ds = kappa * (t × b)`.
struct Helix {
    pos: Vector3<f64>,
    dir: Vector3<f64>,
    b: Vector3<f64>,
    kappa: f64,
}

impl Helix {
    /// Position, tangent and tangent derivative after path `s`.
    fn at(&self, s: f64) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
        let par = self.b * self.dir.dot(&self.b);
        let perp = self.dir - par;
        let w = perp.cross(&self.b);
        let ks = self.kappa * s;
        let (sin, cos) = ks.sin_cos();
        let (f1, f2) = if ks.abs() < 1e-6 {
            (s - self.kappa * ks * s * s / 6., ks * s / 2.)
        } else {
            (sin / self.kappa, (1. - cos) / self.kappa)
        };
        let pos = self.pos + par * s + perp * f1 + w * f2;
        let dir = par + perp * cos + w * sin;
        let ddir = dir.cross(&self.b) * self.kappa;
        (pos, dir, ddir)
    }

    /// Path length to `surface` by Newton iteration from the straight-line estimate.
    fn path_to(&self, surface: &Surface) -> Option<f64> {
        let mut s = surface.straight_line_path(&self.pos, &self.dir)?;
        for _ in 0..MAX_NEWTON_STEPS {
            let (pos, dir, ddir) = self.at(s);
            let q = pos - surface.center();
            let (f, df) = match surface.shape() {
                SurfaceShape::Plane { normal, .. } => (q.dot(normal), dir.dot(normal)),
                SurfaceShape::Line { axis } => {
                    let qp = q - axis * q.dot(axis);
                    let tp = dir - axis * dir.dot(axis);
                    let dtp = ddir - axis * ddir.dot(axis);
                    (qp.dot(&tp), tp.dot(&tp) + qp.dot(&dtp))
                }
            };
            if df.abs() < 1e-12 {
                return None;
            }
            let ds = -f / df;
            s += ds;
            if ds.abs() < PATH_TOLERANCE {
                return Some(s);
            }
        }
        None
    }
}

impl Propagator for HelixPropagator {
    fn propagate(
        &self,
        params: &TrackParameters,
        surface: &Arc<Surface>,
        direction: PropDirection,
        with_jacobian: bool,
    ) -> Option<Propagation> {
        let helix = self.helix(params);
        let path = helix.path_to(surface)?;
        if !direction.accepts(path) {
            return None;
        }
        let (pos, dir, _) = helix.at(path);
        let (phi, theta) = angles(&dir);
        let (loc1, loc2) = surface.global_to_local(&pos, &dir);
        let parameters = TrackParameters::new(
            surface.clone(),
            Vector5::new(loc1, loc2, phi, theta, params.qoverp()),
        );

        let jacobian = if with_jacobian && helix.kappa == 0. {
            straight_plane_jacobian(params, surface, path)
        } else {
            None
        };

        Some(Propagation {
            parameters,
            jacobian,
            path_length: path,
        })
    }

    fn field_is_on(&self) -> bool {
        self.field.norm() > 0.
    }
}

/// Analytic Jacobian of a straight-line transport between two planes over path `s`.
fn straight_plane_jacobian(
    start: &TrackParameters,
    target: &Surface,
    s: f64,
) -> Option<Matrix5<f64>> {
    let SurfaceShape::Plane { u: u1, v: v1, .. } = start.surface().shape() else {
        return None;
    };
    let SurfaceShape::Plane {
        normal: n2,
        u: u2,
        v: v2,
    } = target.shape()
    else {
        return None;
    };

    let (phi, theta) = (start.phi(), start.theta());
    let d = direction(phi, theta);
    let denom = d.dot(n2);
    if denom.abs() < 1e-12 {
        return None;
    }
    let (sin_phi, cos_phi) = phi.sin_cos();
    let (sin_theta, cos_theta) = theta.sin_cos();
    let d_phi = Vector3::new(-sin_theta * sin_phi, sin_theta * cos_phi, 0.);
    let d_theta = Vector3::new(cos_theta * cos_phi, cos_theta * sin_phi, -sin_theta);

    // Moving the start point or turning the direction slides the intersection along `d`.
    let project = |dx: Vector3<f64>| dx - d * (dx.dot(n2) / denom);
    let columns = [
        project(*u1),
        project(*v1),
        project(d_phi) * s,
        project(d_theta) * s,
    ];

    let mut jac = Matrix5::identity();
    for (k, dpos) in columns.iter().enumerate() {
        jac[(LOC1, k)] = dpos.dot(u2);
        jac[(LOC2, k)] = dpos.dot(v2);
    }
    jac[(PHI, PHI)] = 1.;
    jac[(THETA, THETA)] = 1.;
    jac[(QOVERP, QOVERP)] = 1.;
    Some(jac)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::geometry::SurfaceId;

    fn plane(id: u64, x: f64, tilt: f64) -> Arc<Surface> {
        Arc::new(Surface::plane(
            SurfaceId(id),
            Vector3::new(x, 0., 0.),
            Vector3::new(1., tilt, 0.),
            Vector3::y(),
        ))
    }

    #[test]
    fn straight_line_to_plane() {
        let start = TrackParameters::new(
            Arc::new(Surface::perigee(Vector3::zeros())),
            Vector5::new(0., 0., 0.1, 1.2, 0.),
        );
        let target = plane(1, 100., 0.);
        let prop = HelixPropagator::straight()
            .propagate(&start, &target, PropDirection::Along, false)
            .unwrap();
        let pos = prop.parameters.position();
        assert_abs_diff_eq!(pos.x, 100., epsilon = 1e-9);
        assert_abs_diff_eq!(pos.y, 100. * 0.1f64.tan(), epsilon = 1e-9);
        assert_abs_diff_eq!(prop.parameters.phi(), 0.1, epsilon = 1e-12);

        assert!(
            HelixPropagator::straight()
                .propagate(&start, &target, PropDirection::Opposite, false)
                .is_none()
        );
    }

    #[test]
    fn helix_bends_with_expected_radius() {
        let propagator = HelixPropagator::solenoid(2.);
        let qop = 1. / 1000.;
        let start = TrackParameters::new(
            Arc::new(Surface::perigee(Vector3::zeros())),
            Vector5::new(0., 0., 0., std::f64::consts::FRAC_PI_2, qop),
        );
        let target = plane(1, 500., 0.);
        let prop = propagator
            .propagate(&start, &target, PropDirection::Along, false)
            .unwrap();
        let radius = 1. / (C_LIGHT * 2. * qop);
        let pos = prop.parameters.position();
        // Circle through the origin tangent to x, centred on the y axis.
        let center = Vector3::new(0., -radius, 0.);
        assert_abs_diff_eq!((pos - center).norm(), radius, epsilon = 1e-6);
        assert!(prop.jacobian.is_none());
    }

    #[test]
    fn helix_reaches_wire() {
        let propagator = HelixPropagator::solenoid(2.);
        let start = TrackParameters::new(
            Arc::new(Surface::perigee(Vector3::zeros())),
            Vector5::new(0., 0., 0.05, 1.3, -5e-4),
        );
        let wire = Arc::new(Surface::line(
            SurfaceId(9),
            Vector3::new(300., 20., 0.),
            Vector3::z(),
        ));
        let prop = propagator
            .propagate(&start, &wire, PropDirection::Along, false)
            .unwrap();
        let pos = prop.parameters.position();
        let dir = prop.parameters.direction();
        let radial = (pos - wire.center()).xy();
        // Point of closest approach: radial offset orthogonal to the transverse direction.
        assert_abs_diff_eq!(radial.dot(&dir.xy()), 0., epsilon = 1e-7);
        assert_abs_diff_eq!(radial.norm(), prop.parameters.values()[LOC1].abs(), epsilon = 1e-7);
    }

    #[test]
    fn analytic_jacobian_matches_numerical() {
        let propagator = HelixPropagator::straight();
        let start_plane = plane(1, 50., 0.1);
        let target = plane(2, 250., -0.2);
        let start = TrackParameters::new(start_plane, Vector5::new(1.5, -3., 0.2, 1.1, 0.));
        let prop = propagator
            .propagate(&start, &target, PropDirection::Along, true)
            .unwrap();
        let jac = prop.jacobian.unwrap();

        let eps = [1e-4, 1e-4, 1e-7, 1e-7];
        for (k, eps) in eps.iter().enumerate() {
            let mut plus = *start.values();
            plus[k] += eps;
            let mut minus = *start.values();
            minus[k] -= eps;
            let p = propagator
                .propagate(&start.with_values(plus), &target, PropDirection::Along, false)
                .unwrap();
            let m = propagator
                .propagate(&start.with_values(minus), &target, PropDirection::Along, false)
                .unwrap();
            let numerical = (p.parameters.values() - m.parameters.values()) / (2. * eps);
            for row in 0..4 {
                assert_abs_diff_eq!(jac[(row, k)], numerical[row], epsilon = 1e-5);
            }
        }
    }
}
