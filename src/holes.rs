//! Hole search: sensitive elements the fitted track crosses without leaving a hit.
//!
//! Crossings come from a [`HoleExtrapolator`], their classification from a [`BoundaryCheck`].
//! Both are traits so that detector descriptions can plug in their own navigation and
//! conditions data.

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;

use crate::config::FitterConfig;
use crate::geometry::{DetectorCategory, ElementId, Surface};
use crate::navigation::{BoundedVolume, MaterialLayers};
use crate::parameters::{LOC1, LOC2, TrackParameters};
use crate::propagator::{PropDirection, Propagator};

/// Positions closer than this (mm) are the same crossing.
const SAME_POINT_TOLERANCE: f64 = 1e-3;

/// Produces the sensitive-surface crossings of a track.
pub trait HoleExtrapolator {
    /// Crossings from `start` up to and including `target`, ordered along the path.
    fn extrapolate_stepwise(
        &self,
        start: &TrackParameters,
        target: &Arc<Surface>,
        direction: PropDirection,
    ) -> Vec<TrackParameters>;

    /// Crossings from `start` until the track leaves `volume`, ordered along the path.
    fn extrapolate_blindly(
        &self,
        start: &TrackParameters,
        direction: PropDirection,
        volume: &BoundedVolume,
    ) -> Vec<TrackParameters>;
}

/// Extrapolator that intersects the track with every sensitive layer of a geometry.
#[derive(Clone, Debug)]
pub struct LayerStepper<P> {
    propagator: P,
    layers: Arc<MaterialLayers>,
}

impl<P: Propagator> LayerStepper<P> {
    /// Step through the sensitive surfaces of `layers`.
    pub fn new(propagator: P, layers: Arc<MaterialLayers>) -> Self {
        Self { propagator, layers }
    }

    fn crossings(
        &self,
        start: &TrackParameters,
        direction: PropDirection,
        accept: impl Fn(f64, &TrackParameters) -> bool,
    ) -> Vec<(f64, TrackParameters)> {
        let mut crossings: Vec<(f64, TrackParameters)> = self
            .layers
            .sensitive_surfaces()
            .filter_map(|surface| {
                let prop = self.propagator.propagate(start, surface, direction, false)?;
                let params = prop.parameters;
                let values = params.values();
                (surface.inside_bounds(values[LOC1], values[LOC2], 0.)
                    && accept(prop.path_length, &params))
                .then_some((prop.path_length.abs(), params))
            })
            .collect();
        crossings.sort_by(|a, b| a.0.total_cmp(&b.0));
        crossings
    }
}

impl<P: Propagator> HoleExtrapolator for LayerStepper<P> {
    fn extrapolate_stepwise(
        &self,
        start: &TrackParameters,
        target: &Arc<Surface>,
        direction: PropDirection,
    ) -> Vec<TrackParameters> {
        let Some(end) = self.propagator.propagate(start, target, direction, false) else {
            return Vec::new();
        };
        let limit = end.path_length.abs();
        let mut crossings: Vec<TrackParameters> = self
            .crossings(start, direction, |path, params| {
                path.abs() < limit && params.surface().id() != target.id()
            })
            .into_iter()
            .map(|(_, params)| params)
            .collect();
        crossings.push(end.parameters);
        crossings
    }

    fn extrapolate_blindly(
        &self,
        start: &TrackParameters,
        direction: PropDirection,
        volume: &BoundedVolume,
    ) -> Vec<TrackParameters> {
        let start_id = start.surface().id();
        self.crossings(start, direction, |path, params| {
            path.abs() > SAME_POINT_TOLERANCE
                && params.surface().id() != start_id
                && volume.inside(&params.position(), 0.)
        })
        .into_iter()
        .map(|(_, params)| params)
        .collect()
    }
}

/// Classification of a crossing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundaryStatus {
    /// The element carries a hit of the track.
    Hit,
    /// Active element crossed inside its bounds; a hole if no hit is found.
    Candidate,
    /// Element crossed, but it is known to be dead.
    Dead,
    /// Crossing outside the active area.
    Outside,
    /// The element could not be checked.
    Error,
}

/// Classifies crossings for the hole search.
pub trait BoundaryCheck {
    /// Status of the crossing at `params`.
    fn check(&self, params: &TrackParameters) -> BoundaryStatus;
}

/// Checks the local position against the surface bounds, with a set of dead elements.
#[derive(Clone, Debug, Default)]
pub struct SurfaceBoundsCheck {
    tolerance: f64,
    dead: HashSet<ElementId>,
}

impl SurfaceBoundsCheck {
    /// Crossings within `tolerance` (mm) of the edge count as inside; a negative tolerance
    /// excludes the edges.
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            dead: HashSet::new(),
        }
    }

    /// Mark elements as dead.
    pub fn with_dead_elements(mut self, dead: impl IntoIterator<Item = ElementId>) -> Self {
        self.dead.extend(dead);
        self
    }
}

impl BoundaryCheck for SurfaceBoundsCheck {
    fn check(&self, params: &TrackParameters) -> BoundaryStatus {
        let surface = params.surface();
        let Some(element) = surface.element() else {
            return BoundaryStatus::Error;
        };
        let values = params.values();
        if !surface.inside_bounds(values[LOC1], values[LOC2], self.tolerance) {
            BoundaryStatus::Outside
        } else if self.dead.contains(&element.id) {
            BoundaryStatus::Dead
        } else {
            BoundaryStatus::Candidate
        }
    }
}

/// Hole counts of one detector category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CategoryHoles {
    /// Active elements crossed without a hit.
    pub holes: usize,
    /// Strip holes whose other side is a hole as well.
    pub double_holes: usize,
    /// Dead elements crossed.
    pub dead: usize,
}

/// Result of a hole search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HoleCount {
    /// Pixel detector.
    pub pixel: CategoryHoles,
    /// Strip detector.
    pub strip: CategoryHoles,
}

impl HoleCount {
    /// Holes in both silicon categories.
    pub fn total_holes(&self) -> usize {
        self.pixel.holes + self.strip.holes
    }
}

/// One entry of the hole-search walk.
#[derive(Clone, Debug)]
pub(crate) struct HoleSearchState {
    pub parameters: TrackParameters,
    /// Active measurement.
    pub measurement: bool,
    /// Measurement or outlier.
    pub has_hit: bool,
    /// Crossings towards the next entry cached during the last propagation.
    pub cached: Option<Vec<TrackParameters>>,
}

fn close(a: &TrackParameters, b: &TrackParameters) -> bool {
    (a.position() - b.position()).norm() < SAME_POINT_TOLERANCE
}

/// Stepwise crossings from `start` to `target`, without the ones on or at the end points.
pub(crate) fn crossings_between(
    extrapolator: &dyn HoleExtrapolator,
    start: &TrackParameters,
    end: &TrackParameters,
    target: &Arc<Surface>,
    direction: PropDirection,
) -> Vec<TrackParameters> {
    let mut crossings = extrapolator.extrapolate_stepwise(start, target, direction);
    if crossings
        .first()
        .is_some_and(|c| c.surface().id() == start.surface().id() || close(c, start))
    {
        crossings.remove(0);
    }
    if crossings
        .last()
        .is_some_and(|c| c.surface().id() == target.id() || close(c, end))
    {
        crossings.pop();
    }
    crossings
}

#[derive(Default)]
struct Counter {
    count: HoleCount,
    seen: HashSet<ElementId>,
    strip_holes: HashSet<ElementId>,
}

impl Counter {
    fn add(&mut self, crossings: &[TrackParameters], check: &dyn BoundaryCheck, count_holes: bool) {
        for params in crossings {
            let Some(element) = params.surface().element() else {
                continue;
            };
            if self.seen.contains(&element.id) {
                continue;
            }
            let category = match element.category {
                DetectorCategory::Pixel => &mut self.count.pixel,
                DetectorCategory::Strip => &mut self.count.strip,
                _ => continue,
            };
            match check.check(params) {
                BoundaryStatus::Dead => {
                    category.dead += 1;
                    self.seen.insert(element.id);
                }
                BoundaryStatus::Candidate if count_holes => {
                    category.holes += 1;
                    if element.category == DetectorCategory::Strip {
                        if element
                            .other_side
                            .is_some_and(|other| self.strip_holes.contains(&other))
                        {
                            category.double_holes += 1;
                        }
                        self.strip_holes.insert(element.id);
                    }
                    self.seen.insert(element.id);
                }
                _ => {}
            }
        }
    }
}

/// Walk consecutive track states and count the holes between them, then the dead elements
/// beyond the last one. `None` if there are too few measurements.
pub(crate) fn search_holes(
    states: &[HoleSearchState],
    extrapolator: &dyn HoleExtrapolator,
    check: &dyn BoundaryCheck,
    config: &FitterConfig,
) -> Option<HoleCount> {
    let n_measurements = states.iter().filter(|s| s.measurement).count();
    if n_measurements < config.hole_search_min_measurements {
        debug!("Hole search skipped with {n_measurements} measurements.");
        return None;
    }

    let mut counter = Counter::default();
    let mut seen_hit = false;
    for pair in states.windows(2) {
        let (begin, end) = (&pair[0], &pair[1]);
        seen_hit |= begin.has_hit;
        if !seen_hit {
            continue;
        }
        let (from, to) = (&begin.parameters, &end.parameters);
        if (to.position() - from.position()).norm() < config.hole_search_min_separation {
            continue;
        }
        let crossings = match &begin.cached {
            Some(cached) => cached.clone(),
            None => crossings_between(extrapolator, from, to, to.surface(), PropDirection::Along),
        };
        counter.add(&crossings, check, true);
    }

    if let Some(last) = states.last() {
        let volume = BoundedVolume::new(
            config.hole_search_volume.radius,
            config.hole_search_volume.half_length,
        );
        if volume.inside(&last.parameters.position(), 0.) {
            let crossings =
                extrapolator.extrapolate_blindly(&last.parameters, PropDirection::Along, &volume);
            counter.add(&crossings, check, false);
        }
    }

    debug!("Hole search result: {:?}.", counter.count);
    Some(counter.count)
}

#[cfg(test)]
mod tests {
    use nalgebra::{Vector3, Vector5};

    use super::*;
    use crate::geometry::{DetectorElement, SurfaceBounds, SurfaceId};
    use crate::navigation::{Layer, TrackingGeometry, TrackingVolume};
    use crate::propagator::HelixPropagator;

    fn sensor(id: u64, x: f64, category: DetectorCategory, other_side: Option<u64>) -> Arc<Surface> {
        Arc::new(
            Surface::plane(SurfaceId(id), Vector3::new(x, 0., 0.), Vector3::x(), Vector3::y())
                .with_bounds(SurfaceBounds::Rectangle {
                    half_u: 50.,
                    half_v: 50.,
                })
                .with_element(DetectorElement {
                    id: ElementId(id),
                    category,
                    other_side: other_side.map(ElementId),
                }),
        )
    }

    fn stepper(surfaces: &[Arc<Surface>]) -> LayerStepper<HelixPropagator> {
        let mut geometry = TrackingGeometry::new();
        let layers = surfaces
            .iter()
            .map(|surface| {
                geometry.add_layer(Layer {
                    surface: surface.clone(),
                    material: None,
                    sensitive: true,
                })
            })
            .collect();
        geometry.add_volume(TrackingVolume {
            name: "world".into(),
            bounds: BoundedVolume::new(1000., 1000.),
            confined_layers: layers,
            boundary_layers: Vec::new(),
            confined_volumes: Vec::new(),
        });
        LayerStepper::new(
            HelixPropagator::straight(),
            Arc::new(MaterialLayers::collect(&geometry)),
        )
    }

    fn on(surface: &Arc<Surface>, has_hit: bool) -> HoleSearchState {
        HoleSearchState {
            parameters: TrackParameters::new(
                surface.clone(),
                Vector5::new(0., 0., 0., std::f64::consts::FRAC_PI_2, 0.),
            ),
            measurement: has_hit,
            has_hit,
            cached: None,
        }
    }

    fn small_volume() -> FitterConfig {
        let mut config = FitterConfig::default();
        config.hole_search_volume.radius = 10.;
        config
    }

    #[test]
    fn missing_layers_are_holes() {
        let surfaces: Vec<_> = (0..6)
            .map(|i| sensor(i, 50. * (i + 1) as f64, DetectorCategory::Pixel, None))
            .collect();
        let extrapolator = stepper(&surfaces);
        // Hits on layers 0, 1, 4 and 5 only.
        let states: Vec<_> = [0, 1, 4, 5].iter().map(|i| on(&surfaces[*i], true)).collect();
        let check = SurfaceBoundsCheck::new(0.);

        let count = search_holes(&states, &extrapolator, &check, &small_volume()).unwrap();
        assert_eq!(count.pixel.holes, 2);
        assert_eq!(count.strip, CategoryHoles::default());
    }

    #[test]
    fn dead_elements_and_double_strip_holes() {
        let surfaces = vec![
            sensor(1, 50., DetectorCategory::Strip, None),
            sensor(2, 100., DetectorCategory::Strip, Some(3)),
            sensor(3, 101., DetectorCategory::Strip, Some(2)),
            sensor(4, 150., DetectorCategory::Pixel, None),
            sensor(5, 200., DetectorCategory::Strip, None),
            sensor(6, 250., DetectorCategory::Strip, None),
        ];
        let extrapolator = stepper(&surfaces);
        let states: Vec<_> = [0, 4, 5].iter().map(|i| on(&surfaces[*i], true)).collect();
        let check = SurfaceBoundsCheck::new(0.).with_dead_elements([ElementId(4)]);

        let count = search_holes(&states, &extrapolator, &check, &small_volume()).unwrap();
        assert_eq!(count.strip.holes, 2);
        assert_eq!(count.strip.double_holes, 1);
        assert_eq!(count.pixel.dead, 1);
        assert_eq!(count.pixel.holes, 0);
    }

    #[test]
    fn too_few_measurements() {
        let surfaces: Vec<_> = (0..2)
            .map(|i| sensor(i, 50. * (i + 1) as f64, DetectorCategory::Pixel, None))
            .collect();
        let states: Vec<_> = surfaces.iter().map(|s| on(s, true)).collect();
        assert!(
            search_holes(
                &states,
                &stepper(&surfaces),
                &SurfaceBoundsCheck::new(0.),
                &FitterConfig::default()
            )
            .is_none()
        );
    }

    #[test]
    fn blind_extrapolation_counts_only_dead() {
        let surfaces: Vec<_> = (0..5)
            .map(|i| sensor(i, 50. * (i + 1) as f64, DetectorCategory::Pixel, None))
            .collect();
        let extrapolator = stepper(&surfaces);
        let states: Vec<_> = (0..3).map(|i| on(&surfaces[i], true)).collect();
        let check = SurfaceBoundsCheck::new(0.).with_dead_elements([ElementId(4)]);

        let count = search_holes(&states, &extrapolator, &check, &FitterConfig::default()).unwrap();
        assert_eq!(count.pixel.holes, 0);
        assert_eq!(count.pixel.dead, 1);
    }
}
