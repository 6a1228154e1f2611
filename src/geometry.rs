//! Surfaces the track parameters are expressed on, and angle helpers.
//!
//! Two surface shapes cover the fitter's needs: planes (silicon modules, generic material layers)
//! and lines (the beam line used as perigee surface, and drift-tube wires).
//! Surfaces are shared as `Arc<Surface>` and identified by [`SurfaceId`]; the fitter never relies
//! on pointer identity.

use std::f64::consts::{PI, TAU};

use nalgebra::Vector3;

/// Stable identifier of a surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

impl SurfaceId {
    /// Identifier shared by all perigee surfaces created on the fly.
    pub const PERIGEE: SurfaceId = SurfaceId(u64::MAX);
}

/// Stable identifier of a sensitive detector element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

/// Detector technology of a sensitive element; used for hit and hole bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DetectorCategory {
    /// Two-dimensional silicon pixels.
    Pixel,
    /// Silicon micro-strips.
    Strip,
    /// Drift tubes.
    Drift,
    /// Muon chambers.
    Muon,
    /// Anything else (calorimeter, beam spot, ...).
    Other,
}

impl DetectorCategory {
    /// Silicon technologies.
    pub fn is_silicon(self) -> bool {
        matches!(self, Self::Pixel | Self::Strip)
    }
}

/// Sensitive element a surface belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetectorElement {
    /// Identifier of this element.
    pub id: ElementId,
    /// Technology of this element.
    pub category: DetectorCategory,
    /// Partner element on the other side of a double-sided module.
    pub other_side: Option<ElementId>,
}

/// Geometric shape of a surface.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SurfaceShape {
    /// Plane with orthonormal local axes; `u × v = normal`.
    Plane {
        /// Unit normal.
        normal: Vector3<f64>,
        /// First local axis.
        u: Vector3<f64>,
        /// Second local axis.
        v: Vector3<f64>,
    },
    /// Straight line (wire or beam line).
    Line {
        /// Unit direction of the line.
        axis: Vector3<f64>,
    },
}

/// Extent of a surface in its local frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SurfaceBounds {
    /// No bounds.
    Unbounded,
    /// Rectangle centred on the surface origin.
    Rectangle {
        /// Half extent along `u`.
        half_u: f64,
        /// Half extent along `v`.
        half_v: f64,
    },
    /// Drift tube around a line surface.
    Tube {
        /// Tube radius.
        radius: f64,
        /// Half length along the wire.
        half_length: f64,
    },
}

/// A surface in the global frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Surface {
    id: SurfaceId,
    center: Vector3<f64>,
    shape: SurfaceShape,
    bounds: SurfaceBounds,
    element: Option<DetectorElement>,
}

impl Surface {
    /// Create a plane through `center`.
    /// `u_axis` is projected into the plane and normalized; `v` completes a right-handed frame.
    pub fn plane(id: SurfaceId, center: Vector3<f64>, normal: Vector3<f64>, u_axis: Vector3<f64>) -> Self {
        let normal = normal.normalize();
        let u = (u_axis - normal * u_axis.dot(&normal)).normalize();
        let v = normal.cross(&u);
        Self {
            id,
            center,
            shape: SurfaceShape::Plane { normal, u, v },
            bounds: SurfaceBounds::Unbounded,
            element: None,
        }
    }

    /// Create a line through `center` along `axis`.
    pub fn line(id: SurfaceId, center: Vector3<f64>, axis: Vector3<f64>) -> Self {
        Self {
            id,
            center,
            shape: SurfaceShape::Line {
                axis: axis.normalize(),
            },
            bounds: SurfaceBounds::Unbounded,
            element: None,
        }
    }

    /// Perigee surface: a line parallel to the z axis through `point`.
    pub fn perigee(point: Vector3<f64>) -> Self {
        Self::line(SurfaceId::PERIGEE, point, Vector3::z())
    }

    /// Set the bounds.
    pub fn with_bounds(mut self, bounds: SurfaceBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Attach the surface to a sensitive element.
    pub fn with_element(mut self, element: DetectorElement) -> Self {
        self.element = Some(element);
        self
    }

    /// Identifier.
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// Global position of the local origin.
    pub fn center(&self) -> &Vector3<f64> {
        &self.center
    }

    /// Shape.
    pub fn shape(&self) -> &SurfaceShape {
        &self.shape
    }

    /// Bounds.
    pub fn bounds(&self) -> &SurfaceBounds {
        &self.bounds
    }

    /// Sensitive element, if any.
    pub fn element(&self) -> Option<&DetectorElement> {
        self.element.as_ref()
    }

    /// Whether this is a line surface.
    pub fn is_line(&self) -> bool {
        matches!(self.shape, SurfaceShape::Line { .. })
    }

    /// Unit normal of a plane.
    pub fn normal(&self) -> Option<Vector3<f64>> {
        match self.shape {
            SurfaceShape::Plane { normal, .. } => Some(normal),
            SurfaceShape::Line { .. } => None,
        }
    }

    /// Radial axis of a line surface for a track with direction `dir`.
    fn radial_axis(axis: &Vector3<f64>, dir: &Vector3<f64>) -> Vector3<f64> {
        let radial = axis.cross(dir);
        let norm = radial.norm();
        if norm > 1e-12 {
            return radial / norm;
        }
        // Track parallel to the wire: any perpendicular will do.
        let helper = if axis.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
        axis.cross(&helper).normalize()
    }

    /// Global position of local coordinates `(loc1, loc2)` for a track with direction `dir`.
    pub fn local_to_global(&self, loc1: f64, loc2: f64, dir: &Vector3<f64>) -> Vector3<f64> {
        match &self.shape {
            SurfaceShape::Plane { u, v, .. } => self.center + u * loc1 + v * loc2,
            SurfaceShape::Line { axis } => {
                self.center + Self::radial_axis(axis, dir) * loc1 + axis * loc2
            }
        }
    }

    /// Local coordinates of a global position on (or closest to) the surface.
    pub fn global_to_local(&self, pos: &Vector3<f64>, dir: &Vector3<f64>) -> (f64, f64) {
        let d = pos - self.center;
        match &self.shape {
            SurfaceShape::Plane { u, v, .. } => (d.dot(u), d.dot(v)),
            SurfaceShape::Line { axis } => (d.dot(&Self::radial_axis(axis, dir)), d.dot(axis)),
        }
    }

    /// Approximate global position of a measurement when the track direction is unknown.
    pub fn measurement_position(&self, loc1: f64, loc2: f64) -> Vector3<f64> {
        match &self.shape {
            SurfaceShape::Plane { u, v, .. } => self.center + u * loc1 + v * loc2,
            SurfaceShape::Line { axis } => self.center + axis * loc2,
        }
    }

    /// Signed straight-line path length from `pos` along `dir` to the surface
    /// (to the point of closest approach for lines).
    pub fn straight_line_path(&self, pos: &Vector3<f64>, dir: &Vector3<f64>) -> Option<f64> {
        match &self.shape {
            SurfaceShape::Plane { normal, .. } => {
                let denom = dir.dot(normal);
                if denom.abs() < 1e-12 {
                    return None;
                }
                Some((self.center - pos).dot(normal) / denom)
            }
            SurfaceShape::Line { axis } => {
                let w = pos - self.center;
                let w_perp = w - axis * w.dot(axis);
                let d_perp = dir - axis * dir.dot(axis);
                let dd = d_perp.norm_squared();
                if dd < 1e-12 {
                    return None;
                }
                Some(-w_perp.dot(&d_perp) / dd)
            }
        }
    }

    /// Cosine of the incidence angle, used to scale material thickness.
    pub fn incidence_cos(&self, dir: &Vector3<f64>) -> f64 {
        match &self.shape {
            SurfaceShape::Plane { normal, .. } => dir.dot(normal).abs(),
            SurfaceShape::Line { axis } => (1. - dir.dot(axis).powi(2)).max(0.).sqrt(),
        }
    }

    /// Whether local coordinates lie inside the bounds, enlarged by `tolerance`.
    pub fn inside_bounds(&self, loc1: f64, loc2: f64, tolerance: f64) -> bool {
        match self.bounds {
            SurfaceBounds::Unbounded => true,
            SurfaceBounds::Rectangle { half_u, half_v } => {
                loc1.abs() <= half_u + tolerance && loc2.abs() <= half_v + tolerance
            }
            SurfaceBounds::Tube {
                radius,
                half_length,
            } => loc1.abs() <= radius + tolerance && loc2.abs() <= half_length + tolerance,
        }
    }

    /// Radius of a drift tube.
    pub fn tube_radius(&self) -> Option<f64> {
        match self.bounds {
            SurfaceBounds::Tube { radius, .. } => Some(radius),
            _ => None,
        }
    }
}

/// Unit direction for azimuth `phi` and polar angle `theta`.
pub fn direction(phi: f64, theta: f64) -> Vector3<f64> {
    let (sin_phi, cos_phi) = phi.sin_cos();
    let (sin_theta, cos_theta) = theta.sin_cos();
    Vector3::new(sin_theta * cos_phi, sin_theta * sin_phi, cos_theta)
}

/// Azimuth and polar angle of a (not necessarily normalized) direction.
pub fn angles(dir: &Vector3<f64>) -> (f64, f64) {
    let phi = dir.y.atan2(dir.x);
    let theta = dir.xy().norm().atan2(dir.z);
    (phi, theta)
}

/// Wrap an angle difference into [−π, π].
pub fn wrap_angle(mut angle: f64) -> f64 {
    if angle > PI {
        angle -= TAU * ((angle + PI) / TAU).floor();
    } else if angle < -PI {
        angle += TAU * ((PI - angle) / TAU).floor();
    }
    angle
}

/// Bring `(phi, theta)` back into φ∈[−π,π], θ∈[0,π].
///
/// A polar angle beyond either pole is reflected and the azimuth turned by π.
/// Returns `None` if the pair cannot be normalized.
pub fn correct_angles(mut phi: f64, mut theta: f64) -> Option<(f64, f64)> {
    if theta > PI {
        theta = TAU - theta;
        phi += PI;
    }
    if theta < 0. {
        theta = -theta;
        phi += PI;
    }
    if phi > PI {
        phi -= TAU;
    }
    if phi < -PI {
        phi += TAU;
    }
    if !(0. ..=PI).contains(&theta) || !(-PI..=PI).contains(&phi) {
        return None;
    }
    Some((phi, theta))
}

#[cfg(test)]
mod tests {
    use std::f64::consts::FRAC_PI_2;

    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn plane_frame_is_right_handed() {
        let plane = Surface::plane(
            SurfaceId(1),
            Vector3::new(100., 0., 0.),
            Vector3::x(),
            Vector3::new(0.2, 1., 0.),
        );
        let SurfaceShape::Plane { normal, u, v } = plane.shape() else {
            panic!("expected a plane");
        };
        assert_abs_diff_eq!(u.dot(normal), 0., epsilon = 1e-14);
        assert_abs_diff_eq!(u.cross(v), *normal, epsilon = 1e-14);
    }

    #[test]
    fn plane_local_global() {
        let plane = Surface::plane(SurfaceId(1), Vector3::new(100., 0., 0.), Vector3::x(), Vector3::y());
        let dir = direction(0.1, 1.2);
        let pos = plane.local_to_global(3., -4., &dir);
        assert_abs_diff_eq!(pos, Vector3::new(100., 3., -4.), epsilon = 1e-12);
        let (l1, l2) = plane.global_to_local(&pos, &dir);
        assert_abs_diff_eq!(l1, 3., epsilon = 1e-12);
        assert_abs_diff_eq!(l2, -4., epsilon = 1e-12);
    }

    #[test]
    fn line_closest_approach() {
        let wire = Surface::line(SurfaceId(2), Vector3::new(50., 0., 0.), Vector3::z());
        let pos = Vector3::new(0., 1.5, 0.);
        let dir = Vector3::x();
        let s = wire.straight_line_path(&pos, &dir).unwrap();
        assert_abs_diff_eq!(s, 50., epsilon = 1e-12);

        let (r, z) = wire.global_to_local(&(pos + dir * s), &dir);
        assert_abs_diff_eq!(r.abs(), 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(z, 0., epsilon = 1e-12);
        assert_abs_diff_eq!(wire.local_to_global(r, z, &dir), pos + dir * s, epsilon = 1e-12);
    }

    #[test]
    fn parallel_track_never_reaches_plane() {
        let plane = Surface::plane(SurfaceId(1), Vector3::zeros(), Vector3::x(), Vector3::y());
        assert!(plane.straight_line_path(&Vector3::zeros(), &Vector3::y()).is_none());
    }

    #[test]
    fn angle_correction() {
        let (phi, theta) = correct_angles(0.5, -0.2).unwrap();
        assert_abs_diff_eq!(theta, 0.2, epsilon = 1e-14);
        assert_abs_diff_eq!(phi, 0.5 + PI - TAU, epsilon = 1e-14);

        let (phi, theta) = correct_angles(-0.5, PI + 0.3).unwrap();
        assert_abs_diff_eq!(theta, PI - 0.3, epsilon = 1e-14);
        assert_abs_diff_eq!(phi, PI - 0.5, epsilon = 1e-14);

        assert!(correct_angles(0., 5. * PI).is_none());
        assert_eq!(correct_angles(1., FRAC_PI_2), Some((1., FRAC_PI_2)));
    }

    #[test]
    fn angles_of_direction() {
        let (phi, theta) = angles(&direction(-2., 0.7));
        assert_abs_diff_eq!(phi, -2., epsilon = 1e-14);
        assert_abs_diff_eq!(theta, 0.7, epsilon = 1e-14);
        assert_abs_diff_eq!(wrap_angle(3. * PI / 2.), -PI / 2., epsilon = 1e-14);
        assert_abs_diff_eq!(wrap_angle(-7.), -7. + TAU, epsilon = 1e-14);
    }
}
