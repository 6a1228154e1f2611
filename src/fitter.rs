//! The fitter: inputs, material collection, the iteration loop and the final track.

use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use log::{debug, info};
use nalgebra::{DMatrix, Matrix5, Vector3};
use ndarray::Array2;

use crate::config::FitterConfig;
use crate::error::{FitError, FitStatistics, FitStatisticsSnapshot};
use crate::geometry::{DetectorCategory, Surface, SurfaceId};
use crate::holes::{BoundaryCheck, HoleCount, HoleExtrapolator, HoleSearchState, search_holes};
use crate::iteration::FitContext;
use crate::material::{
    BetheEnergyLoss, EnergyLossModel, HighlandScattering, MaterialEffect, ParticleHypothesis,
    ScatteringModel,
};
use crate::measurement::{Measurement, MeasurementCorrector};
use crate::navigation::{GeometryNavigator, MaterialLayers};
use crate::ndarray_utils::IntoNdarray2;
use crate::normal::NormalEquations;
use crate::parameters::{FitQuality, LOC1, LOC2, QOP_SCALE, QOVERP, TrackParameters};
use crate::propagator::{HelixPropagator, PropDirection, Propagator};
use crate::state::{StateKind, TrackState};
use crate::track::{FittedState, FittedStateKind, Track};
use crate::trajectory::Trajectory;

/// Reduced chi-square cut used for silicon-only tracks fitted without outlier removal.
const LOOSE_CHI2_CUT: f64 = 999.;

/// Drift hits a track needs before its precision-hit fraction is checked.
const MIN_DRIFT_HITS_FOR_FRACTION: usize = 15;

/// Energy loss (MeV) and its width assumed for electrons at every material layer.
const ELECTRON_DELTA_E: f64 = -5.;
const ELECTRON_SIGMA_E: f64 = 50.;

/// Inputs of one independent fit, for batch fitting.
#[derive(Clone, Debug)]
pub struct FitJob {
    /// Measurements in any order.
    pub measurements: Vec<Measurement>,
    /// Starting parameters.
    pub seed: TrackParameters,
    /// Whether outliers are removed.
    pub run_outlier: bool,
    /// Particle hypothesis.
    pub particle: ParticleHypothesis,
}

/// Global chi-square track fitter.
///
/// The fitter itself is immutable during a fit; all per-fit state lives on the stack of the
/// fitting call, so one fitter can serve many threads.
pub struct Fitter<P: Propagator = HelixPropagator> {
    pub(crate) propagator: P,
    pub(crate) config: FitterConfig,
    pub(crate) scattering: Arc<dyn ScatteringModel + Send + Sync>,
    pub(crate) energy_loss: Arc<dyn EnergyLossModel + Send + Sync>,
    pub(crate) layers: Option<Arc<MaterialLayers>>,
    pub(crate) corrector: Option<Arc<dyn MeasurementCorrector + Send + Sync>>,
    pub(crate) broad_corrector: Option<Arc<dyn MeasurementCorrector + Send + Sync>>,
    pub(crate) hole_extrapolator: Option<Arc<dyn HoleExtrapolator + Send + Sync>>,
    pub(crate) boundary_check: Option<Arc<dyn BoundaryCheck + Send + Sync>>,
    statistics: FitStatistics,
}

impl<P: Propagator + fmt::Debug> fmt::Debug for Fitter<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fitter")
            .field("propagator", &self.propagator)
            .field("config", &self.config)
            .field(
                "material_layers",
                &self.layers.as_ref().map(|l| l.material_layers().len()),
            )
            .field("corrector", &self.corrector.is_some())
            .field("broad_corrector", &self.broad_corrector.is_some())
            .field("hole_search", &self.hole_extrapolator.is_some())
            .field("statistics", &self.statistics.snapshot())
            .finish_non_exhaustive()
    }
}

impl<P: Propagator> Fitter<P> {
    /// Fitter with the default configuration, Highland scattering and Bethe energy loss.
    /// No material is collected until layers are provided.
    pub fn new(propagator: P) -> Self {
        Self {
            propagator,
            config: FitterConfig::default(),
            scattering: Arc::new(HighlandScattering),
            energy_loss: Arc::new(BetheEnergyLoss),
            layers: None,
            corrector: None,
            broad_corrector: None,
            hole_extrapolator: None,
            boundary_check: None,
            statistics: FitStatistics::default(),
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: FitterConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the pre-fit mode.
    pub fn with_prefit(mut self, prefit: bool) -> Self {
        self.config.prefit = prefit;
        self
    }

    /// Set the multiple-scattering model.
    pub fn with_scattering_model(
        mut self,
        model: impl ScatteringModel + Send + Sync + 'static,
    ) -> Self {
        self.scattering = Arc::new(model);
        self
    }

    /// Set the energy-loss model.
    pub fn with_energy_loss_model(
        mut self,
        model: impl EnergyLossModel + Send + Sync + 'static,
    ) -> Self {
        self.energy_loss = Arc::new(model);
        self
    }

    /// Use already collected material layers.
    pub fn with_material_layers(mut self, layers: Arc<MaterialLayers>) -> Self {
        self.layers = Some(layers);
        self
    }

    /// Collect the material layers of a tracking geometry.
    pub fn with_geometry<N: GeometryNavigator + ?Sized>(self, navigator: &N) -> Self {
        self.with_material_layers(Arc::new(MaterialLayers::collect(navigator)))
    }

    /// Set the precise hit corrector.
    pub fn with_corrector(mut self, corrector: impl MeasurementCorrector + Send + Sync + 'static) -> Self {
        self.corrector = Some(Arc::new(corrector));
        self
    }

    /// Set the broad hit corrector.
    pub fn with_broad_corrector(
        mut self,
        corrector: impl MeasurementCorrector + Send + Sync + 'static,
    ) -> Self {
        self.broad_corrector = Some(Arc::new(corrector));
        self
    }

    /// Enable the hole search.
    pub fn with_hole_search(
        mut self,
        extrapolator: impl HoleExtrapolator + Send + Sync + 'static,
        check: impl BoundaryCheck + Send + Sync + 'static,
    ) -> Self {
        self.hole_extrapolator = Some(Arc::new(extrapolator));
        self.boundary_check = Some(Arc::new(check));
        self.config.hole_search = true;
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &FitterConfig {
        &self.config
    }

    /// Diagnostic counters of all fits so far.
    pub fn statistics(&self) -> FitStatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// Fit `measurements`, starting from `seed`.
    pub fn fit(
        &self,
        measurements: &[Measurement],
        seed: &TrackParameters,
        run_outlier: bool,
        particle: ParticleHypothesis,
    ) -> Result<Track, FitError> {
        self.statistics.record_attempt();
        let hits = measurements
            .iter()
            .cloned()
            .map(TrackState::measurement)
            .collect();
        let result = self.fit_states(hits, None, seed, run_outlier, particle);
        self.record(result)
    }

    /// Fit a track again, from its perigee, with its measurements and outliers.
    /// The material is reused if so configured.
    pub fn refit(
        &self,
        track: &Track,
        run_outlier: bool,
        particle: ParticleHypothesis,
    ) -> Result<Track, FitError> {
        self.statistics.record_attempt();
        let material = self.reused_material([track]);
        let result = self.fit_states(
            track.hit_states(),
            material,
            track.perigee(),
            run_outlier,
            particle,
        );
        self.record(result)
    }

    /// Fit a track with additional measurements. The material is collected again.
    pub fn extend(
        &self,
        track: &Track,
        measurements: &[Measurement],
        run_outlier: bool,
        particle: ParticleHypothesis,
    ) -> Result<Track, FitError> {
        self.statistics.record_attempt();
        let mut hits = track.hit_states();
        hits.extend(measurements.iter().cloned().map(TrackState::measurement));
        let result = self.fit_states(hits, None, track.perigee(), run_outlier, particle);
        self.record(result)
    }

    /// Fit the states of two tracks together, from the perigee of the first.
    pub fn fit_combined(
        &self,
        first: &Track,
        second: &Track,
        run_outlier: bool,
        particle: ParticleHypothesis,
    ) -> Result<Track, FitError> {
        self.statistics.record_attempt();
        let mut hits = first.hit_states();
        hits.extend(second.hit_states());
        let material = self.reused_material([first, second]);
        let result = self.fit_states(hits, material, first.perigee(), run_outlier, particle);
        self.record(result)
    }

    fn record(&self, result: Result<Track, FitError>) -> Result<Track, FitError> {
        match &result {
            Ok(_) => self.statistics.record_success(),
            Err(err) => {
                debug!("Fit failed: {err}");
                self.statistics.record_failure(err);
            }
        }
        result
    }

    fn reused_material<'a>(&self, tracks: impl IntoIterator<Item = &'a Track>) -> Option<Vec<TrackState>> {
        if !self.config.reuse_material {
            return None;
        }
        let material: Vec<TrackState> = tracks
            .into_iter()
            .flat_map(Track::material_states)
            .collect();
        (!material.is_empty()).then_some(material)
    }

    /// Seed expressed on the perigee surface at the reference point.
    fn make_perigee(&self, seed: &TrackParameters, straight: bool) -> Result<TrackParameters, FitError> {
        let mut perigee = if seed.surface().id() == SurfaceId::PERIGEE {
            seed.clone()
        } else {
            let surface = Arc::new(Surface::perigee(Vector3::from(self.config.reference_point)));
            self.propagator
                .propagate(seed, &surface, PropDirection::Any, false)
                .ok_or(FitError::ExtrapolationFailure { state: 0 })?
                .parameters
        };
        if straight && perigee.qoverp() != 0. {
            let mut values = *perigee.values();
            values[QOVERP] = 0.;
            perigee = perigee.with_values(values);
        }
        Ok(perigee)
    }

    /// Material states from the collected layers, between the reference point and the last
    /// measurement, with their projected distance along the seed.
    fn collect_material(
        &self,
        first: f64,
        last: f64,
        perigee: &TrackParameters,
        particle: ParticleHypothesis,
        has_drift: bool,
    ) -> Vec<(f64, TrackState)> {
        let Some(layers) = &self.layers else {
            return Vec::new();
        };
        let straight = !self.propagator.field_is_on();
        let mass = particle.mass();
        let momentum = if straight {
            self.config.fixed_momentum
        } else {
            perigee.momentum()
        };
        let origin = perigee.position();
        let dir = perigee.direction();
        let electron = particle == ParticleHypothesis::Electron && self.config.asymmetric_energy_loss;

        layers
            .material_layers()
            .iter()
            .filter_map(|layer| {
                let params = self
                    .propagator
                    .propagate(perigee, &layer.surface, PropDirection::Any, false)?
                    .parameters;
                let values = params.values();
                if !layer.surface.inside_bounds(values[LOC1], values[LOC2], 0.) {
                    return None;
                }
                let position = params.position();
                let distance = (position - origin).dot(&dir);
                if distance < first.min(0.) || distance > last {
                    return None;
                }
                let cos = layer.surface.incidence_cos(&params.direction());
                if cos <= 0. {
                    return None;
                }
                let x0 = layer.material.thickness_in_x0() / cos;
                let sigma = self.scattering.sigma(x0, momentum, mass);
                let loss = self.energy_loss.energy_loss(
                    &layer.material,
                    layer.material.thickness / cos,
                    momentum,
                    particle,
                );

                let mut effect = MaterialEffect::new(x0)
                    .with_scattering(sigma / params.theta().sin(), sigma)
                    .with_layer(layer.id);
                if !straight {
                    effect = effect.with_energy_loss(-loss.delta_e.abs());
                }
                if electron {
                    effect = effect.with_energy_loss(ELECTRON_DELTA_E).with_fitted_energy_loss(
                        ELECTRON_SIGMA_E,
                        loss.sigma_minus,
                        loss.sigma_plus,
                    );
                    if !has_drift {
                        effect = effect.with_scattering(0., 0.);
                    }
                } else if self.config.fit_energy_loss && !straight {
                    effect = effect.with_fitted_energy_loss(loss.sigma, loss.sigma_minus, loss.sigma_plus);
                }
                if effect.sigma_delta_theta == 0. && !effect.is_brem() && effect.delta_e == 0. {
                    return None;
                }
                Some((distance, TrackState::material(effect, layer.surface.clone(), position)))
            })
            .sorted_by(|a, b| a.0.total_cmp(&b.0))
            .collect()
    }

    /// Build the trajectory and run the fit.
    fn fit_states(
        &self,
        hits: Vec<TrackState>,
        material: Option<Vec<TrackState>>,
        seed: &TrackParameters,
        run_outlier: bool,
        particle: ParticleHypothesis,
    ) -> Result<Track, FitError> {
        if hits.is_empty() {
            return Err(FitError::NotEnoughMeasurements { ndof: 0 });
        }
        let straight = !self.propagator.field_is_on();
        let interacting = particle != ParticleHypothesis::NonInteracting && self.config.material_effects;
        let with_material = interacting
            && (self.layers.is_some() || material.as_ref().is_some_and(|m| !m.is_empty()));
        if straight && particle == ParticleHypothesis::Electron {
            return Err(FitError::InvalidInput(
                "electron hypothesis in a straight-line fit".into(),
            ));
        }
        if straight && with_material && self.config.fixed_momentum <= 0. {
            return Err(FitError::InvalidInput(
                "straight-line fit with material needs a fixed momentum".into(),
            ));
        }
        let perigee = self.make_perigee(seed, straight)?;
        if !straight && with_material && perigee.qoverp() == 0. {
            return Err(FitError::InvalidInput(
                "material effects need a seed with non-zero q/p".into(),
            ));
        }

        let origin = perigee.position();
        let dir = perigee.direction();
        let along = |state: TrackState| ((state.position() - origin).dot(&dir), state);
        let has_drift = hits.iter().any(|s| {
            s.measurement_state()
                .is_some_and(|m| m.measurement.category() == DetectorCategory::Drift)
        });
        let hits: Vec<(f64, TrackState)> = hits
            .into_iter()
            .map(along)
            .sorted_by(|a, b| a.0.total_cmp(&b.0))
            .collect();
        let first = hits.first().map_or(0., |h| h.0);
        let last = hits.last().map_or(0., |h| h.0);
        let material: Vec<(f64, TrackState)> = match material {
            _ if !interacting => Vec::new(),
            Some(states) => states
                .into_iter()
                .map(along)
                .sorted_by(|a, b| a.0.total_cmp(&b.0))
                .collect(),
            None => self.collect_material(first, last, &perigee, particle, has_drift),
        };

        let mass = particle.mass();
        let mut traj = Trajectory::new(straight, mass);
        traj.set_n_perigee_parameters(if straight { 4 } else { 5 });
        for (_, mut state) in hits.into_iter().merge_by(material, |a, b| a.0 <= b.0) {
            if state.material_effect().is_some() {
                if let Some(effect) = state
                    .material_effect_mut()
                    .filter(|e| e.is_brem() && e.delta_p == 0.)
                {
                    effect.seed_delta_p(&perigee, mass);
                }
                traj.add_material_state(state);
            } else {
                traj.add_measurement_state(state);
            }
        }
        if traj.n_hits() == 0 || traj.ndof() < 0 {
            return Err(FitError::NotEnoughMeasurements { ndof: traj.ndof() });
        }
        traj.set_reference_parameters(perigee);
        debug!(
            "Fitting {} hits ({} silicon, {} drift, {} outliers) with {} scatterers and {} brems, ndof = {}.",
            traj.n_hits(),
            traj.n_silicon_hits(),
            traj.n_drift_hits(),
            traj.n_outliers(),
            traj.n_scatterers(),
            traj.n_brems(),
            traj.ndof()
        );

        if self.config.prefit && traj.has_material() {
            self.run_prefit(&mut traj);
        }
        let mut ctx = FitContext::new(
            run_outlier,
            self.config.asymmetric_energy_loss,
            self.config.min_iterations,
        );
        let eq = self.iterate(&mut traj, &mut ctx)?;
        self.finish(traj, ctx, eq, particle)
    }

    /// Fit with the energy-loss scatterers frozen and adopt the result as reference.
    fn run_prefit(&self, traj: &mut Trajectory) {
        let mut pre = traj.clone();
        pre.set_prefit(true);
        let mut ctx = FitContext::new(false, false, self.config.min_iterations);
        match self.iterate(&mut pre, &mut ctx) {
            Ok(_) => {
                if let Some(reference) = pre.reference_parameters() {
                    debug!(
                        "Pre-fit converged after {} updates with chi2 {:.3}.",
                        ctx.updates,
                        pre.chi2()
                    );
                    traj.set_reference_parameters(reference.clone());
                }
            }
            Err(err) => debug!("Pre-fit failed ({err}), starting from the seed."),
        }
    }

    /// Iterate until convergence.
    fn iterate(
        &self,
        traj: &mut Trajectory,
        ctx: &mut FitContext,
    ) -> Result<NormalEquations, FitError> {
        let mut eq = NormalEquations::new(traj.n_fit_parameters());
        let mut doderiv = true;
        let max = self.config.max_iterations;
        let recalibrate = self.corrector.is_some() && self.broad_corrector.is_some();

        for it in 0..max {
            if traj.converged() {
                break;
            }
            if it + 1 >= max {
                return Err(FitError::NoConvergence {
                    max_iterations: max,
                    last_chi2: traj.chi2(),
                });
            }
            ctx.iteration = it;
            self.run_iteration(traj, ctx, &mut eq, &mut doderiv)?;
            ctx.chi2_history.push(traj.chi2());

            let ndof = traj.ndof();
            let (red, prev_red) = if ndof > 0 {
                (traj.chi2() / ndof as f64, traj.prev_chi2() / ndof as f64)
            } else {
                (traj.chi2(), traj.prev_chi2())
            };
            let nsi = traj.n_silicon_hits();
            let ndrift = traj.n_drift_hits();
            if !traj.prefit()
                && it > 0
                && it < 4
                && ((red < prev_red && (red > prev_red - 1. || red < 2.))
                    || nsi + ndrift == traj.n_hits())
                && (ctx.run_outlier || recalibrate)
                && ndrift > 0
                && (it != 1 || nsi != 0 || ndof <= 0 || red <= 3.)
            {
                self.clean_drift_hits(traj, ctx, &mut eq)?;
            }

            let cut = self.config.min_precision_hit_fraction;
            let ndrift = traj.n_drift_hits();
            if cut > 0. && it >= 3 && ndrift >= MIN_DRIFT_HITS_FOR_FRACTION {
                let fraction =
                    ndrift.saturating_sub(traj.n_drift_tube_hits()) as f64 / ndrift as f64;
                if fraction < cut {
                    return Err(FitError::OutlierLogicFailure(format!(
                        "precision drift hit fraction {fraction:.3} below {cut:.3}"
                    )));
                }
            }

            if !traj.converged() {
                self.update_parameters(traj, &eq)?;
                ctx.updates += 1;
            }
        }
        Ok(eq)
    }

    /// Cleaning, quality cuts, hole search and errors of a converged trajectory.
    fn finish(
        &self,
        mut traj: Trajectory,
        mut ctx: FitContext,
        mut eq: NormalEquations,
        particle: ParticleHypothesis,
    ) -> Result<Track, FitError> {
        let mut cov = eq.covariance()?;
        if (ctx.run_outlier || self.broad_corrector.is_some())
            && traj.n_silicon_hits() == traj.n_hits()
        {
            self.calculate_track_errors(&mut traj, &cov, true);
            self.clean_precision_hits(&mut traj, &mut ctx, &mut eq, &mut cov)?;
        }

        if ctx.run_outlier && traj.n_outliers() > self.config.max_outliers {
            return Err(FitError::OutlierLogicFailure(format!(
                "{} outliers, at most {} allowed",
                traj.n_outliers(),
                self.config.max_outliers
            )));
        }
        let cut = if traj.n_silicon_hits() == traj.n_hits() && !ctx.run_outlier {
            LOOSE_CHI2_CUT
        } else {
            self.config.chi2_per_dof_cut
        };
        let ndof = traj.ndof();
        if ndof > 0 {
            let chi2_per_dof = traj.chi2() / ndof as f64;
            if chi2_per_dof > cut {
                return Err(FitError::HighChi2 { chi2_per_dof, cut });
            }
        }

        let holes = self.search_track_holes(&mut traj)?;
        if self.config.measurement_track_parameters {
            self.calculate_track_errors(&mut traj, &cov, false);
        }

        let n_perigee = traj.n_perigee_parameters();
        let scaled: Vec<usize> = (n_perigee == 5)
            .then_some(QOVERP)
            .into_iter()
            .chain(traj.brem_column(0)..cov.nrows())
            .collect();
        let n = cov.nrows();
        for &k in &scaled {
            for j in 0..n {
                cov[(k, j)] *= QOP_SCALE;
                cov[(j, k)] *= QOP_SCALE;
            }
        }
        self.make_track(traj, ctx, cov, particle, holes)
    }

    /// Hole search along the fitted trajectory, reusing the crossings of a last propagation.
    fn search_track_holes(&self, traj: &mut Trajectory) -> Result<Option<HoleCount>, FitError> {
        if !self.config.hole_search {
            return Ok(None);
        }
        let (Some(extrapolator), Some(check)) = (
            self.hole_extrapolator.as_deref(),
            self.boundary_check.as_deref(),
        ) else {
            return Ok(None);
        };
        self.propagate_states(traj, false, true)?;

        let nup = traj.n_upstream_states();
        let states = traj.states();
        let Some(last) = states.iter().rposition(TrackState::is_measurement) else {
            return Ok(None);
        };
        let mut walk: Vec<(Option<usize>, HoleSearchState)> = Vec::new();
        for (index, state) in states.iter().enumerate().take(last + 1) {
            if index == nup {
                if let Some(reference) = traj.reference_parameters() {
                    walk.push((
                        None,
                        HoleSearchState {
                            parameters: reference.clone(),
                            measurement: false,
                            has_hit: false,
                            cached: None,
                        },
                    ));
                }
            }
            let (Some(meas), Some(params)) = (state.measurement_state(), state.parameters()) else {
                continue;
            };
            walk.push((
                Some(index),
                HoleSearchState {
                    parameters: params.clone(),
                    measurement: !meas.outlier,
                    has_hit: true,
                    cached: None,
                },
            ));
            // The first hit outside the silicon closes the walk.
            if !meas.measurement.category().is_silicon() {
                break;
            }
        }

        // Crossings between two walk entries are cached piecewise on the states between them.
        for k in 0..walk.len().saturating_sub(1) {
            if let (Some(from), Some(to)) = (walk[k].0, walk[k + 1].0) {
                if from >= nup {
                    walk[k].1.cached = states[from..to]
                        .iter()
                        .map(|s| s.holes.clone())
                        .collect::<Option<Vec<_>>>()
                        .map(|pieces| pieces.concat());
                }
            }
        }
        let walk: Vec<HoleSearchState> = walk.into_iter().map(|(_, s)| s).collect();
        Ok(search_holes(&walk, extrapolator, check, &self.config))
    }

    fn make_track(
        &self,
        mut traj: Trajectory,
        ctx: FitContext,
        cov: DMatrix<f64>,
        particle: ParticleHypothesis,
        holes: Option<HoleCount>,
    ) -> Result<Track, FitError> {
        let straight = traj.straight_line();
        let n_perigee = traj.n_perigee_parameters();
        let mut perigee_cov = Matrix5::zeros();
        for i in 0..n_perigee {
            for j in 0..n_perigee {
                perigee_cov[(i, j)] = cov[(i, j)];
            }
        }
        if straight {
            perigee_cov[(QOVERP, QOVERP)] = 1e-20;
        }
        let perigee = traj
            .reference_parameters()
            .cloned()
            .ok_or_else(|| FitError::InvalidInput("trajectory has no reference parameters".into()))?
            .with_covariance(perigee_cov);

        let derivatives = derivative_matrix(&mut traj);
        let fit_quality = FitQuality::new(traj.chi2(), traj.ndof());
        let nup = traj.n_upstream_states();
        let perigee_state = FittedState {
            kind: FittedStateKind::Perigee,
            surface: perigee.surface().clone(),
            parameters: Some(perigee.clone()),
            fit_quality: None,
        };
        let mut states = Vec::with_capacity(traj.states().len() + 1);
        for (index, state) in traj.states().iter().enumerate() {
            if index == nup {
                states.push(perigee_state.clone());
            }
            let kind = match &state.kind {
                StateKind::Measurement(m) if m.outlier => FittedStateKind::Outlier(m.measurement.clone()),
                StateKind::Measurement(m) => FittedStateKind::Measurement(m.measurement.clone()),
                StateKind::Material(effect) => FittedStateKind::Material(effect.clone()),
                StateKind::Basic => continue,
            };
            states.push(FittedState {
                kind,
                surface: state.surface.clone(),
                parameters: state.parameters.clone(),
                fit_quality: state.fit_quality,
            });
        }
        if nup >= traj.states().len() {
            states.push(perigee_state);
        }

        info!(
            "Fit converged after {} updates: chi2 = {:.3}, ndof = {}, {} outliers.",
            ctx.updates,
            fit_quality.chi2,
            fit_quality.ndof,
            traj.n_outliers()
        );
        Ok(Track {
            states,
            perigee,
            fit_quality,
            particle,
            straight_line: straight,
            holes,
            iterations: ctx.updates,
            chi2_history: ctx.chi2_history,
            covariance: cov.into_ndarray2(),
            derivatives,
        })
    }
}

/// Unweighted derivatives of the active measurement rows, in physical q/p units.
fn derivative_matrix(traj: &mut Trajectory) -> Array2<f64> {
    let straight = traj.straight_line();
    let first_brem = traj.brem_column(0);
    let n = traj.n_fit_parameters();
    let rows: Vec<usize> = traj
        .states()
        .iter()
        .zip(traj.measurement_rows())
        .filter(|(s, _)| s.is_measurement())
        .flat_map(|(s, row)| row..row + s.n_measured())
        .collect();
    let (_, err, wd) = traj.buffers();
    if wd.ncols() != n || wd.nrows() < rows.iter().max().map_or(0, |r| r + 1) {
        return Array2::zeros((rows.len(), n));
    }
    Array2::from_shape_fn((rows.len(), n), |(r, c)| {
        let row = rows[r];
        let scale = if (c == QOVERP && !straight) || c >= first_brem {
            1. / QOP_SCALE
        } else {
            1.
        };
        wd[[row, c]] * err[row] * scale
    })
}

#[cfg(feature = "parallel")]
mod parallel {
    use rayon::prelude::*;

    use super::*;

    impl<P: Propagator + Sync> Fitter<P> {
        /// Fit independent jobs in parallel, each as with [`Fitter::fit()`].
        pub fn fit_par(&self, jobs: &[FitJob]) -> Vec<Result<Track, FitError>> {
            jobs.par_iter()
                .map(|job| self.fit(&job.measurements, &job.seed, job.run_outlier, job.particle))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::FRAC_PI_2;

    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use nalgebra::Vector5;

    use super::*;
    use crate::geometry::ElementId;
    use crate::holes::{LayerStepper, SurfaceBoundsCheck};
    use crate::material::MaterialProperties;
    use crate::navigation::{BoundedVolume, Layer, TrackingGeometry, TrackingVolume};
    use crate::parameters::{PHI, THETA};
    use crate::test_utils::*;

    fn config() -> FitterConfig {
        FitterConfig {
            chi2_change_tolerance: 1e-4,
            ..FitterConfig::default()
        }
    }

    fn straight_fitter() -> Fitter {
        Fitter::new(HelixPropagator::straight()).with_config(config())
    }

    #[test]
    fn straight_telescope_recovers_truth() {
        init_logger();
        let propagator = HelixPropagator::straight();
        let truth = truth(0.);
        let hits = exact_pixels(&crossings(&propagator, &truth, &telescope(8, 50., 50.)));

        let track = straight_fitter()
            .fit(&hits, &seed(0.), true, ParticleHypothesis::Pion)
            .unwrap();

        assert!(track.is_straight_line());
        assert_eq!(track.fit_quality().ndof, 16 - 4);
        assert!(track.fit_quality().chi2 < 1e-6);
        for i in 0..4 {
            assert_abs_diff_eq!(track.perigee().values()[i], truth.values()[i], epsilon = 1e-5);
        }
        let cov = track.perigee().covariance().unwrap();
        assert_eq!(cov[(QOVERP, QOVERP)], 1e-20);
        assert!(cov[(LOC1, LOC1)] > 0.);
        assert_eq!(track.covariance().dim(), (4, 4));
        assert_eq!(track.derivative_matrix().dim(), (16, 4));
        // Perigee first, then the measurements.
        assert!(matches!(track.states()[0].kind(), FittedStateKind::Perigee));
        assert!(track.states()[1..].iter().all(|s| s.parameters().is_some()));
    }

    #[test]
    fn collinear_hits_match_closed_form_least_squares() {
        let xs = [50., 100., 150., 200., 250.];
        let ys = [0.1, -0.05, 0.2, 0., 0.15];
        let hits: Vec<_> = telescope(5, 50., 50.)
            .into_iter()
            .zip(ys)
            .map(|(s, y)| Measurement::pixel(s, y, 0., PIXEL_SIGMA, PIXEL_SIGMA))
            .collect();

        let track = straight_fitter()
            .fit(&hits, &seed(0.), false, ParticleHypothesis::Pion)
            .unwrap();

        let n = xs.len() as f64;
        let (mx, my) = (xs.iter().sum::<f64>() / n, ys.iter().sum::<f64>() / n);
        let sxy: f64 = xs.iter().zip(ys).map(|(x, y)| (x - mx) * (y - my)).sum();
        let sxx: f64 = xs.iter().map(|x| (x - mx).powi(2)).sum();
        let slope = sxy / sxx;
        let intercept = my - slope * mx;
        let rss: f64 = xs
            .iter()
            .zip(ys)
            .map(|(x, y)| (y - intercept - slope * x).powi(2))
            .sum();

        let fitted: Vec<f64> = track
            .states()
            .iter()
            .filter(|s| s.measurement().is_some())
            .map(|s| s.parameters().unwrap().values()[LOC1])
            .collect();
        for (x, y) in xs.iter().zip(fitted) {
            assert_abs_diff_eq!(y, intercept + slope * x, epsilon = 1e-6);
        }
        assert_relative_eq!(
            track.fit_quality().chi2,
            rss / (PIXEL_SIGMA * PIXEL_SIGMA),
            max_relative = 1e-6
        );
        assert_eq!(track.fit_quality().ndof, 10 - 4);
    }

    #[test]
    fn chi2_history_decreases() {
        let propagator = HelixPropagator::straight();
        let hits = smeared_pixels(
            &crossings(&propagator, &truth(0.), &telescope(8, 50., 50.)),
            &mut rng(),
        );
        let track = straight_fitter()
            .fit(&hits, &seed(0.), false, ParticleHypothesis::Pion)
            .unwrap();

        let history = track.chi2_history();
        assert!(history.len() >= 2);
        for pair in history.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-6, "{history:?}");
        }
        assert_abs_diff_eq!(*history.last().unwrap(), track.fit_quality().chi2, epsilon = 1e-9);
        assert_eq!(track.iterations() + 1, history.len());
    }

    #[test]
    fn displaced_pixel_becomes_outlier() {
        init_logger();
        let propagator = HelixPropagator::straight();
        let mut hits = smeared_pixels(
            &crossings(&propagator, &truth(0.), &telescope(10, 50., 50.)),
            &mut rng(),
        );
        let displaced = hits[5].clone();
        let v = displaced.values();
        hits[5] = Measurement::pixel(
            displaced.surface().clone(),
            v[LOC1] + 10. * PIXEL_SIGMA,
            v[LOC2],
            PIXEL_SIGMA,
            PIXEL_SIGMA,
        );

        let fitter = straight_fitter();
        let cleaned = fitter
            .fit(&hits, &seed(0.), true, ParticleHypothesis::Pion)
            .unwrap();
        let kept = fitter
            .fit(&hits, &seed(0.), false, ParticleHypothesis::Pion)
            .unwrap();

        let outliers: Vec<_> = cleaned.outliers().collect();
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].surface().id(), displaced.surface().id());
        assert_eq!(cleaned.fit_quality().ndof, kept.fit_quality().ndof - 2);
        assert!(cleaned.fit_quality().chi2 + 50. < kept.fit_quality().chi2);
        assert_eq!(kept.outliers().count(), 0);
    }

    #[test]
    fn refit_reproduces_the_chi2() {
        let propagator = HelixPropagator::straight();
        let hits = smeared_pixels(
            &crossings(&propagator, &truth(0.), &telescope(8, 50., 50.)),
            &mut rng(),
        );
        let fitter = straight_fitter();
        let track = fitter
            .fit(&hits, &seed(0.), false, ParticleHypothesis::Pion)
            .unwrap();
        let refitted = fitter.refit(&track, false, ParticleHypothesis::Pion).unwrap();

        assert_abs_diff_eq!(refitted.fit_quality().chi2, track.fit_quality().chi2, epsilon = 1e-3);
        assert_eq!(refitted.fit_quality().ndof, track.fit_quality().ndof);
        assert!(refitted.iterations() <= track.iterations());
    }

    #[test]
    fn extend_and_combine_match_the_full_fit() {
        let propagator = HelixPropagator::straight();
        let hits = smeared_pixels(
            &crossings(&propagator, &truth(0.), &telescope(10, 50., 50.)),
            &mut rng(),
        );
        let fitter = straight_fitter();
        let pion = ParticleHypothesis::Pion;
        let full = fitter.fit(&hits, &seed(0.), false, pion).unwrap();
        let inner = fitter.fit(&hits[..5], &seed(0.), false, pion).unwrap();
        let outer = fitter.fit(&hits[5..], &seed(0.), false, pion).unwrap();

        let extended = fitter.extend(&inner, &hits[5..], false, pion).unwrap();
        assert_eq!(extended.fit_quality().ndof, full.fit_quality().ndof);
        assert_abs_diff_eq!(extended.fit_quality().chi2, full.fit_quality().chi2, epsilon = 1e-4);

        let combined = fitter.fit_combined(&inner, &outer, false, pion).unwrap();
        assert_eq!(combined.measurements().count(), 10);
        assert_abs_diff_eq!(combined.fit_quality().chi2, full.fit_quality().chi2, epsilon = 1e-4);
    }

    #[test]
    fn helix_in_solenoid_recovers_momentum() {
        init_logger();
        let propagator = HelixPropagator::solenoid(2.);
        let truth = truth(1e-3);
        let hits = exact_pixels(&crossings(&propagator, &truth, &telescope(10, 50., 50.)));
        let mut seed = *truth.values();
        seed[PHI] += 2e-3;
        seed[QOVERP] = 1.2e-3;

        let track = Fitter::new(propagator)
            .with_config(config())
            .fit(&hits, &perigee(seed), false, ParticleHypothesis::NonInteracting)
            .unwrap();

        assert!(!track.is_straight_line());
        assert_eq!(track.fit_quality().ndof, 20 - 5);
        assert_relative_eq!(track.perigee().qoverp(), 1e-3, max_relative = 1e-3);
        assert_abs_diff_eq!(track.perigee().phi(), truth.phi(), epsilon = 1e-5);
        assert_abs_diff_eq!(track.perigee().theta(), truth.theta(), epsilon = 1e-5);
        assert!(track.perigee().covariance().unwrap()[(QOVERP, QOVERP)] > 0.);
    }

    #[test]
    fn drift_hit_outside_its_tube_is_rejected() {
        init_logger();
        let propagator = HelixPropagator::straight();
        let truth = truth(0.);
        let pixels = exact_pixels(&crossings(&propagator, &truth, &telescope(4, 50., 50.)));

        // Straws centred on the track, except one whose wire sits 3 mm beside it.
        let straws: Vec<_> = (0..10)
            .map(|i| {
                let x = 300. + 20. * i as f64;
                let on_track = propagator
                    .propagate(&truth, &plane(100, x), PropDirection::Along, false)
                    .unwrap()
                    .parameters
                    .position();
                let offset = if i == 4 { 3. } else { 0.5 };
                straw(10 + i, x, on_track.y + offset, 2.)
            })
            .collect();
        let mut hits = pixels;
        for (i, params) in crossings(&propagator, &truth, &straws).iter().enumerate() {
            let radius = if i == 4 { 0.5 } else { params.values()[LOC1] };
            hits.push(Measurement::drift_circle(params.surface().clone(), radius, 0.1));
        }

        let track = straight_fitter()
            .fit(&hits, &seed(0.), true, ParticleHypothesis::Pion)
            .unwrap();
        let outliers: Vec<_> = track.outliers().collect();
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].surface().id(), SurfaceId(14));
        assert_eq!(track.fit_quality().ndof, 8 + 9 - 4);
    }

    #[test]
    fn strips_match_closed_form_least_squares() {
        let xs = [50., 100., 150., 200., 250.];
        let ys = [0.12, -0.04, 0.18, 0.02, 0.1];
        // Axial strips measure y; two stereo strips at 90 degrees fix z.
        let mut hits: Vec<_> = telescope(5, 50., 50.)
            .into_iter()
            .zip(ys)
            .map(|(s, y)| Measurement::strip(s, y, PIXEL_SIGMA, 0.))
            .collect();
        hits.push(Measurement::strip(plane(6, 60.), 0., PIXEL_SIGMA, 1.));
        hits.push(Measurement::strip(plane(7, 240.), 0., PIXEL_SIGMA, 1.));

        let track = straight_fitter()
            .fit(&hits, &seed(0.), false, ParticleHypothesis::Pion)
            .unwrap();

        let n = xs.len() as f64;
        let (mx, my) = (xs.iter().sum::<f64>() / n, ys.iter().sum::<f64>() / n);
        let sxy: f64 = xs.iter().zip(ys).map(|(x, y)| (x - mx) * (y - my)).sum();
        let sxx: f64 = xs.iter().map(|x| (x - mx).powi(2)).sum();
        let slope = sxy / sxx;
        let intercept = my - slope * mx;
        let rss: f64 = xs
            .iter()
            .zip(ys)
            .map(|(x, y)| (y - intercept - slope * x).powi(2))
            .sum();

        for (id, x) in (1..=5).zip(xs) {
            let state = track
                .states()
                .iter()
                .find(|s| s.surface().id() == SurfaceId(id))
                .unwrap();
            let y = state.parameters().unwrap().values()[LOC1];
            assert_abs_diff_eq!(y, intercept + slope * x, epsilon = 1e-6);
        }
        assert_relative_eq!(
            track.fit_quality().chi2,
            rss / (PIXEL_SIGMA * PIXEL_SIGMA),
            max_relative = 1e-6
        );
        assert_eq!(track.fit_quality().ndof, 7 - 4);
        assert_abs_diff_eq!(track.perigee().theta(), FRAC_PI_2, epsilon = 1e-9);
    }

    #[test]
    fn zero_error_components_are_left_out_of_the_fit() {
        let propagator = HelixPropagator::straight();
        let mut hits = exact_pixels(&crossings(&propagator, &truth(0.), &telescope(6, 50., 50.)));
        let v = *hits[2].values();
        hits[2] = Measurement::pixel(hits[2].surface().clone(), v[LOC1], v[LOC2], PIXEL_SIGMA, 0.);
        // Far off the track, but without any usable error.
        let v = *hits[4].values();
        hits[4] = Measurement::pixel(hits[4].surface().clone(), v[LOC1] + 1., v[LOC2], 0., 0.);

        let track = straight_fitter()
            .fit(&hits, &seed(0.), true, ParticleHypothesis::Pion)
            .unwrap();

        assert_eq!(track.measurements().count(), 5);
        assert_eq!(track.outliers().count(), 0);
        assert_eq!(track.fit_quality().ndof, 5 * 2 - 1 - 4);
        assert!(track.fit_quality().chi2 < 1e-6);
        assert_eq!(track.derivative_matrix().dim(), (9, 4));
    }

    /// Straws along z whose wires sit 0.5 mm beside the straight truth track, 20 mm apart
    /// from x = 300.
    fn straws_beside_track(n: usize) -> Vec<Arc<Surface>> {
        let propagator = HelixPropagator::straight();
        let truth = truth(0.);
        (0..n)
            .map(|i| {
                let x = 300. + 20. * i as f64;
                let on_track = propagator
                    .propagate(&truth, &plane(100, x), PropDirection::Along, false)
                    .unwrap()
                    .parameters
                    .position();
                straw(10 + i as u64, x, on_track.y + 0.5, 2.)
            })
            .collect()
    }

    /// Exact drift circles on `straws`; the first `n_tube` are tube hits.
    fn drift_hits(straws: &[Arc<Surface>], n_tube: usize) -> Vec<Measurement> {
        crossings(&HelixPropagator::straight(), &truth(0.), straws)
            .iter()
            .enumerate()
            .map(|(i, params)| {
                let sigma = if i < n_tube { 1.2 } else { 0.1 };
                Measurement::drift_circle(params.surface().clone(), params.values()[LOC1], sigma)
            })
            .collect()
    }

    #[test]
    fn precision_fraction_needs_enough_drift_hits() {
        init_logger();
        let propagator = HelixPropagator::straight();
        let pixels = exact_pixels(&crossings(&propagator, &truth(0.), &telescope(4, 50., 50.)));
        // Iteration 3 is reached before convergence.
        let fitter = Fitter::new(propagator).with_config(FitterConfig {
            min_precision_hit_fraction: 0.5,
            min_iterations: 4,
            ..config()
        });
        let fit = |n: usize, n_tube: usize| {
            let mut hits = pixels.clone();
            hits.extend(drift_hits(&straws_beside_track(n), n_tube));
            fitter.fit(&hits, &seed(0.), false, ParticleHypothesis::Pion)
        };

        // 4 of 14 precise: too few drift hits for the check.
        let short = fit(14, 10).unwrap();
        assert_eq!(short.fit_quality().ndof, 8 + 14 - 4);
        // 5 of 15 precise.
        assert!(matches!(fit(15, 10), Err(FitError::OutlierLogicFailure(_))));
        // 10 of 15 precise.
        assert!(fit(15, 5).is_ok());
        assert_eq!(fitter.statistics().outlier_failures, 1);
    }

    fn material_geometry(positions: &[f64]) -> TrackingGeometry {
        let mut geometry = TrackingGeometry::new();
        let layers = positions
            .iter()
            .enumerate()
            .map(|(i, x)| {
                geometry.add_layer(Layer {
                    surface: plane(200 + i as u64, *x),
                    material: Some(MaterialProperties::silicon(1.)),
                    sensitive: false,
                })
            })
            .collect();
        geometry.add_volume(TrackingVolume {
            name: "barrel".into(),
            bounds: BoundedVolume::new(1000., 1000.),
            confined_layers: layers,
            boundary_layers: Vec::new(),
            confined_volumes: Vec::new(),
        });
        geometry
    }

    #[test]
    fn material_is_inserted_between_measurements() {
        init_logger();
        let propagator = HelixPropagator::solenoid(2.);
        let truth = truth(1e-3);
        let hits = exact_pixels(&crossings(&propagator, &truth, &telescope(10, 50., 50.)));
        let geometry = material_geometry(&[25., 75., 175., 275., 600.]);

        for prefit in [false, true] {
            let fitter = Fitter::new(propagator)
                .with_config(config())
                .with_geometry(&geometry)
                .with_prefit(prefit);
            let track = fitter
                .fit(&hits, &seed(1.1e-3), false, ParticleHypothesis::Pion)
                .unwrap();

            assert_eq!(track.material_effects().count(), 4);
            assert!(track.material_effects().all(|m| m.sigma_delta_theta > 0. && m.delta_e < 0.));
            // Path order: the x positions increase along the states.
            let xs: Vec<f64> = track
                .states()
                .iter()
                .filter_map(|s| s.parameters())
                .map(|p| p.position().x)
                .collect();
            assert!(xs.windows(2).all(|w| w[0] < w[1]), "{xs:?}");
            assert_eq!(track.covariance().nrows(), 5 + 2 * 4);
            assert!(track.fit_quality().chi2_per_dof() < 1.);
            assert_relative_eq!(track.perigee().qoverp(), 1e-3, max_relative = 0.05);
        }
    }

    #[test]
    fn electron_brem_is_fitted_as_a_kink() {
        init_logger();
        let propagator = HelixPropagator::solenoid(2.);
        let truth = truth(1e-3);
        let surfaces = telescope(10, 50., 50.);
        // The electron loses 30% of its momentum in the layer at x = 275.
        let at_layer = propagator
            .propagate(&truth, &plane(200, 275.), PropDirection::Along, false)
            .unwrap()
            .parameters;
        let mut values = *at_layer.values();
        values[QOVERP] = 1. / 700.;
        let after = at_layer.with_values(values);
        let mut hits = exact_pixels(&crossings(&propagator, &truth, &surfaces[..5]));
        hits.extend(exact_pixels(&crossings(&propagator, &after, &surfaces[5..])));

        let fitter = Fitter::new(propagator)
            .with_config(FitterConfig {
                asymmetric_energy_loss: true,
                ..config()
            })
            .with_geometry(&material_geometry(&[275.]));
        let track = fitter
            .fit(&hits, &seed(1.1e-3), false, ParticleHypothesis::Electron)
            .unwrap();

        let effects: Vec<_> = track.material_effects().collect();
        assert_eq!(effects.len(), 1);
        let brem = effects[0];
        assert!(brem.is_brem());
        // No drift hits: electrons do not scatter.
        assert_eq!(brem.sigma_delta_theta, 0.);
        assert!(brem.kink);
        assert_relative_eq!(brem.sigma_delta_e, 10. * brem.sigma_delta_e_pos, max_relative = 1e-12);
        assert_eq!(track.covariance().nrows(), 5 + 1);

        // Momentum before and after the layer, from the fitted states.
        let qop_on = |id: u64| {
            track
                .states()
                .iter()
                .find(|s| s.surface().id() == SurfaceId(id))
                .and_then(|s| s.parameters())
                .unwrap()
                .qoverp()
        };
        assert_relative_eq!(qop_on(5), 1e-3, max_relative = 1e-2);
        assert_relative_eq!(qop_on(6), 1. / 700., max_relative = 1e-2);
        assert_relative_eq!(track.perigee().qoverp(), 1e-3, max_relative = 1e-2);
        assert!(track.fit_quality().chi2_per_dof() < 1.);
    }

    #[test]
    fn refit_reuses_material() {
        let propagator = HelixPropagator::solenoid(2.);
        let hits = exact_pixels(&crossings(&propagator, &truth(1e-3), &telescope(10, 50., 50.)));
        let geometry = material_geometry(&[75., 175., 275.]);
        let fitter = Fitter::new(propagator).with_config(config()).with_geometry(&geometry);
        let track = fitter
            .fit(&hits, &seed(1.1e-3), false, ParticleHypothesis::Pion)
            .unwrap();

        let refitted = fitter.refit(&track, false, ParticleHypothesis::Pion).unwrap();
        assert_eq!(refitted.material_effects().count(), 3);
        assert_eq!(
            refitted.material_effects().map(|m| m.layer).collect::<Vec<_>>(),
            track.material_effects().map(|m| m.layer).collect::<Vec<_>>()
        );
        assert_abs_diff_eq!(refitted.fit_quality().chi2, track.fit_quality().chi2, epsilon = 1e-2);
    }

    #[test]
    fn hole_search_counts_missing_and_dead_sensors() {
        init_logger();
        let propagator = HelixPropagator::straight();
        let sensors: Vec<_> = (0..6)
            .map(|i| sensor(i + 1, 50. * (i + 1) as f64, DetectorCategory::Pixel))
            .collect();
        let mut geometry = TrackingGeometry::new();
        let layers = sensors
            .iter()
            .map(|s| {
                geometry.add_layer(Layer {
                    surface: s.clone(),
                    material: None,
                    sensitive: true,
                })
            })
            .collect();
        geometry.add_volume(TrackingVolume {
            name: "pixel".into(),
            bounds: BoundedVolume::new(500., 500.),
            confined_layers: layers,
            boundary_layers: Vec::new(),
            confined_volumes: Vec::new(),
        });
        let layers = Arc::new(MaterialLayers::collect(&geometry));

        let truth = truth(0.);
        let all = exact_pixels(&crossings(&propagator, &truth, &sensors));
        // No hit on the third sensor; the last one is dead.
        let hits: Vec<_> = [0, 1, 3, 4].iter().map(|i| all[*i].clone()).collect();
        let fitter = straight_fitter().with_hole_search(
            LayerStepper::new(propagator, layers),
            SurfaceBoundsCheck::new(0.).with_dead_elements([ElementId(6)]),
        );
        let track = fitter
            .fit(&hits, &seed(0.), false, ParticleHypothesis::Pion)
            .unwrap();

        let holes = track.holes().unwrap();
        assert_eq!(holes.pixel.holes, 1);
        assert_eq!(holes.pixel.dead, 1);
        assert_eq!(holes.strip.holes, 0);
    }

    #[test]
    fn hole_search_reaches_the_first_drift_hit() {
        init_logger();
        let propagator = HelixPropagator::straight();
        let sensors: Vec<_> = (0..5)
            .map(|i| sensor(i + 1, 50. * (i + 1) as f64, DetectorCategory::Pixel))
            .collect();
        let mut geometry = TrackingGeometry::new();
        let layers = sensors
            .iter()
            .map(|s| {
                geometry.add_layer(Layer {
                    surface: s.clone(),
                    material: None,
                    sensitive: true,
                })
            })
            .collect();
        geometry.add_volume(TrackingVolume {
            name: "pixel".into(),
            bounds: BoundedVolume::new(500., 500.),
            confined_layers: layers,
            boundary_layers: Vec::new(),
            confined_volumes: Vec::new(),
        });
        let layers = Arc::new(MaterialLayers::collect(&geometry));

        // Hits on the first four sensors, none on the last one before the straws.
        let mut hits = exact_pixels(&crossings(&propagator, &truth(0.), &sensors[..4]));
        hits.extend(drift_hits(&straws_beside_track(5), 0));
        let fitter = straight_fitter().with_hole_search(
            LayerStepper::new(propagator, layers),
            SurfaceBoundsCheck::new(0.),
        );
        let track = fitter
            .fit(&hits, &seed(0.), false, ParticleHypothesis::Pion)
            .unwrap();

        let holes = track.holes().unwrap();
        assert_eq!(holes.pixel.holes, 1);
        assert_eq!(holes.pixel.dead, 0);
    }

    #[test]
    fn invalid_inputs_are_rejected_and_counted() {
        let fitter = straight_fitter();
        let pion = ParticleHypothesis::Pion;
        let one_hit = vec![Measurement::pixel(plane(1, 50.), 0., 0., 0.01, 0.01)];

        assert_eq!(
            fitter.fit(&[], &seed(0.), false, pion).unwrap_err(),
            FitError::NotEnoughMeasurements { ndof: 0 }
        );
        assert_eq!(
            fitter.fit(&one_hit, &seed(0.), false, pion).unwrap_err(),
            FitError::NotEnoughMeasurements { ndof: -2 }
        );
        assert!(matches!(
            fitter.fit(&one_hit, &seed(0.), false, ParticleHypothesis::Electron),
            Err(FitError::InvalidInput(_))
        ));

        let geometry = material_geometry(&[75.]);
        let with_material = straight_fitter().with_geometry(&geometry);
        assert!(matches!(
            with_material.fit(&one_hit, &seed(0.), false, pion),
            Err(FitError::InvalidInput(_))
        ));
        let in_field = Fitter::new(HelixPropagator::solenoid(2.)).with_geometry(&geometry);
        assert!(matches!(
            in_field.fit(&one_hit, &seed(0.), false, pion),
            Err(FitError::InvalidInput(_))
        ));

        let stats = fitter.statistics();
        assert_eq!(stats.attempted, 3);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.not_enough_measurements, 2);
        assert_eq!(stats.invalid_input, 1);
    }

    #[test]
    fn seed_off_the_perigee_is_moved_there() {
        let propagator = HelixPropagator::straight();
        let truth = truth(0.);
        let surfaces = telescope(6, 50., 50.);
        let hits = exact_pixels(&crossings(&propagator, &truth, &surfaces));
        let start = TrackParameters::new(
            surfaces[0].clone(),
            Vector5::new(0., 0., 0., FRAC_PI_2, 0.),
        );

        let track = straight_fitter()
            .fit(&hits, &start, false, ParticleHypothesis::Pion)
            .unwrap();
        assert_eq!(track.perigee().surface().id(), SurfaceId::PERIGEE);
        assert_abs_diff_eq!(track.perigee().values()[THETA], truth.theta(), epsilon = 1e-5);
    }

    #[test]
    fn statistics_count_successes() {
        let propagator = HelixPropagator::straight();
        let hits = exact_pixels(&crossings(&propagator, &truth(0.), &telescope(5, 50., 50.)));
        let fitter = straight_fitter();
        fitter.fit(&hits, &seed(0.), false, ParticleHypothesis::Pion).unwrap();
        fitter.fit(&hits[..1], &seed(0.), false, ParticleHypothesis::Pion).unwrap_err();

        let stats = fitter.statistics();
        assert_eq!((stats.attempted, stats.succeeded), (2, 1));
        assert!(format!("{fitter:?}").contains("Fitter"));
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn parallel_fits_match_sequential() {
        let propagator = HelixPropagator::straight();
        let surfaces = telescope(8, 50., 50.);
        let mut rng = rng();
        let jobs: Vec<FitJob> = (0..6)
            .map(|_| FitJob {
                measurements: smeared_pixels(&crossings(&propagator, &truth(0.), &surfaces), &mut rng),
                seed: seed(0.),
                run_outlier: false,
                particle: ParticleHypothesis::Pion,
            })
            .collect();
        let fitter = straight_fitter();

        let parallel = fitter.fit_par(&jobs);
        for (job, result) in jobs.iter().zip(parallel) {
            let sequential = fitter
                .fit(&job.measurements, &job.seed, job.run_outlier, job.particle)
                .unwrap();
            assert_abs_diff_eq!(result.unwrap().fit_quality().chi2, sequential.fit_quality().chi2);
        }
        assert_eq!(fitter.statistics().succeeded, 12);
    }
}
