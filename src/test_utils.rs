//! Synthetic detectors and tracks shared by the tests.

use std::f64::consts::FRAC_PI_2;
use std::sync::Arc;

use nalgebra::{Vector3, Vector5};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use simplelog::{Config, LevelFilter, TestLogger};

use crate::geometry::{DetectorCategory, DetectorElement, ElementId, Surface, SurfaceBounds, SurfaceId};
use crate::measurement::Measurement;
use crate::parameters::{LOC1, LOC2, TrackParameters};
use crate::propagator::{PropDirection, Propagator};

pub(crate) const PIXEL_SIGMA: f64 = 0.01;

pub(crate) fn init_logger() {
    let _ = TestLogger::init(LevelFilter::Debug, Config::default());
}

pub(crate) fn rng() -> StdRng {
    StdRng::seed_from_u64(42)
}

/// Unbounded plane at `x`, facing the x axis.
pub(crate) fn plane(id: u64, x: f64) -> Arc<Surface> {
    Arc::new(Surface::plane(
        SurfaceId(id),
        Vector3::new(x, 0., 0.),
        Vector3::x(),
        Vector3::y(),
    ))
}

/// Bounded sensor plane at `x` with a detector element of the same id.
pub(crate) fn sensor(id: u64, x: f64, category: DetectorCategory) -> Arc<Surface> {
    Arc::new(
        Surface::plane(SurfaceId(id), Vector3::new(x, 0., 0.), Vector3::x(), Vector3::y())
            .with_bounds(SurfaceBounds::Rectangle {
                half_u: 100.,
                half_v: 100.,
            })
            .with_element(DetectorElement {
                id: ElementId(id),
                category,
                other_side: None,
            }),
    )
}

/// Straw along z through `(x, y)`.
pub(crate) fn straw(id: u64, x: f64, y: f64, radius: f64) -> Arc<Surface> {
    Arc::new(
        Surface::line(SurfaceId(id), Vector3::new(x, y, 0.), Vector3::z()).with_bounds(
            SurfaceBounds::Tube {
                radius,
                half_length: 1000.,
            },
        ),
    )
}

/// Planes at `x0, x0 + step, ...`.
pub(crate) fn telescope(n: usize, x0: f64, step: f64) -> Vec<Arc<Surface>> {
    (0..n)
        .map(|i| plane(i as u64 + 1, x0 + step * i as f64))
        .collect()
}

pub(crate) fn perigee(values: Vector5<f64>) -> TrackParameters {
    TrackParameters::new(Arc::new(Surface::perigee(Vector3::zeros())), values)
}

/// A slightly dipping track along x, `qop = 0` for straight lines.
pub(crate) fn truth(qop: f64) -> TrackParameters {
    perigee(Vector5::new(0.5, -0.3, 0.01, 1.5, qop))
}

/// A seed pointing straight along x with the given q/p.
pub(crate) fn seed(qop: f64) -> TrackParameters {
    perigee(Vector5::new(0., 0., 0., FRAC_PI_2, qop))
}

/// Truth parameters on every surface.
pub(crate) fn crossings<P: Propagator>(
    propagator: &P,
    truth: &TrackParameters,
    surfaces: &[Arc<Surface>],
) -> Vec<TrackParameters> {
    surfaces
        .iter()
        .map(|s| {
            propagator
                .propagate(truth, s, PropDirection::Along, false)
                .unwrap()
                .parameters
        })
        .collect()
}

/// Pixel hits exactly on the truth crossings.
pub(crate) fn exact_pixels(crossings: &[TrackParameters]) -> Vec<Measurement> {
    crossings
        .iter()
        .map(|c| {
            let v = c.values();
            Measurement::pixel(c.surface().clone(), v[LOC1], v[LOC2], PIXEL_SIGMA, PIXEL_SIGMA)
        })
        .collect()
}

/// Pixel hits smeared with their resolution.
pub(crate) fn smeared_pixels(crossings: &[TrackParameters], rng: &mut StdRng) -> Vec<Measurement> {
    let noise = Normal::new(0., PIXEL_SIGMA).unwrap();
    crossings
        .iter()
        .map(|c| {
            let v = c.values();
            Measurement::pixel(
                c.surface().clone(),
                v[LOC1] + noise.sample(rng),
                v[LOC2] + noise.sample(rng),
                PIXEL_SIGMA,
                PIXEL_SIGMA,
            )
        })
        .collect()
}
