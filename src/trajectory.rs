//! The ordered set of states being fitted, plus the buffers of the linearized problem.
//!
//! Fit parameters are laid out as
//! `[perigee (4 or 5) | scatterers (phi, theta) ... | brems (delta_p) ...]`,
//! residual rows as `[measured scalars of every measurement/outlier state ... | one per brem]`.

use log::{debug, warn};
use ndarray::{Array1, Array2};

use crate::geometry::DetectorCategory;
use crate::measurement::MeasurementKind;
use crate::parameters::{LOC1, TrackParameters};
use crate::state::{StateKind, TrackState};

/// Drift hits with an error at or above this value (mm) are tube hits.
pub(crate) const TUBE_HIT_ERROR: f64 = 1.;

/// Ordered states of one fit and the derived counts and buffers.
#[derive(Clone, Debug)]
pub struct Trajectory {
    states: Vec<TrackState>,
    reference: Option<TrackParameters>,
    n_perigee: usize,
    ndof: i32,
    n_hits: usize,
    n_outliers: usize,
    n_silicon: usize,
    n_drift: usize,
    n_drift_tube: usize,
    n_pseudo: usize,
    n_scatterers: usize,
    n_brems: usize,
    n_upstream_states: usize,
    n_upstream_scatterers: usize,
    n_upstream_brems: usize,
    total_x0: f64,
    total_energy_loss: f64,
    chi2: f64,
    prev_chi2: f64,
    converged: bool,
    prefit: bool,
    straight_line: bool,
    mass: f64,
    residuals: Array1<f64>,
    errors: Array1<f64>,
    weighted_derivatives: Array2<f64>,
}

impl Trajectory {
    /// Empty trajectory. In straight-line mode q/p is not fitted.
    pub fn new(straight_line: bool, mass: f64) -> Self {
        Self {
            states: Vec::new(),
            reference: None,
            n_perigee: 0,
            ndof: 0,
            n_hits: 0,
            n_outliers: 0,
            n_silicon: 0,
            n_drift: 0,
            n_drift_tube: 0,
            n_pseudo: 0,
            n_scatterers: 0,
            n_brems: 0,
            n_upstream_states: 0,
            n_upstream_scatterers: 0,
            n_upstream_brems: 0,
            total_x0: 0.,
            total_energy_loss: 0.,
            chi2: 0.,
            prev_chi2: 0.,
            converged: false,
            prefit: false,
            straight_line,
            mass,
            residuals: Array1::zeros(0),
            errors: Array1::zeros(0),
            weighted_derivatives: Array2::zeros((0, 0)),
        }
    }

    /// Append a measurement or outlier state.
    ///
    /// Returns `false` (and leaves the trajectory untouched) if the state measures nothing, or
    /// duplicates a measurement with the same key on the same surface.
    pub fn add_measurement_state(&mut self, state: TrackState) -> bool {
        let Some(meas) = state.measurement_state() else {
            return false;
        };
        let n_measured = meas.n_measured();
        if n_measured == 0 {
            warn!(
                "Skipping measurement on surface {:?} without any usable error.",
                state.surface().id()
            );
            return false;
        }
        let kind = *meas.measurement.kind();
        let key = meas.measurement.key();
        let id = state.surface().id();
        if !kind.allows_shared_surface() {
            let duplicate = self.states.iter().any(|s| {
                s.measurement_state().is_some_and(|m| {
                    s.surface().id() == id && m.measurement.key() == key
                })
            });
            if duplicate {
                debug!("Rejecting duplicate measurement on surface {id:?}.");
                return false;
            }
        }

        let outlier = meas.outlier;
        let category = kind.category();
        let tube = matches!(kind, MeasurementKind::DriftCircle { .. })
            && meas.errors[LOC1] >= TUBE_HIT_ERROR;
        if outlier {
            self.n_outliers += 1;
        } else {
            self.ndof += n_measured as i32;
            self.count_hit(category, matches!(kind, MeasurementKind::Pseudo), tube, 1);
        }
        self.states.push(state);
        self.invalidate_buffers();
        true
    }

    /// Append a material state.
    pub fn add_material_state(&mut self, state: TrackState) {
        let Some(effect) = state.material_effect() else {
            return;
        };
        self.total_x0 += effect.x0;
        self.total_energy_loss += effect.delta_e.abs();
        self.states.push(state);
        self.recount_material();
        self.invalidate_buffers();
    }

    /// Append a reference state; no effect on the degrees of freedom.
    pub fn add_basic_state(&mut self, state: TrackState) {
        self.states.push(state);
    }

    fn count_hit(&mut self, category: DetectorCategory, pseudo: bool, tube: bool, delta: isize) {
        let bump = |n: &mut usize| *n = n.saturating_add_signed(delta);
        bump(&mut self.n_hits);
        if pseudo {
            bump(&mut self.n_pseudo);
        }
        match category {
            DetectorCategory::Pixel | DetectorCategory::Strip => bump(&mut self.n_silicon),
            DetectorCategory::Drift => {
                bump(&mut self.n_drift);
                if tube {
                    bump(&mut self.n_drift_tube);
                }
            }
            _ => {}
        }
    }

    fn recount_material(&mut self) {
        let prefit = self.prefit;
        self.n_scatterers = self.states.iter().filter(|s| s.is_scatterer(prefit)).count();
        self.n_brems = self.states.iter().filter(|s| s.is_brem()).count();
        let upstream = &self.states[..self.n_upstream_states.min(self.states.len())];
        self.n_upstream_scatterers = upstream.iter().filter(|s| s.is_scatterer(prefit)).count();
        self.n_upstream_brems = upstream.iter().filter(|s| s.is_brem()).count();
    }

    /// Set how many perigee parameters are fitted (4 in straight-line mode, else 5).
    pub fn set_n_perigee_parameters(&mut self, n: usize) {
        self.ndof += self.n_perigee as i32 - n as i32;
        self.n_perigee = n;
        self.invalidate_buffers();
    }

    /// Replace the reference parameters. The first call also determines which leading states
    /// lie upstream of the reference point.
    pub fn set_reference_parameters(&mut self, params: TrackParameters) {
        if self.reference.is_none() {
            let origin = params.position();
            let dir = params.direction();
            self.n_upstream_states = self
                .states
                .iter()
                .take_while(|s| (s.position() - origin).dot(&dir) < 0.)
                .count();
            self.reference = Some(params);
            self.recount_material();
        } else {
            self.reference = Some(params);
        }
    }

    /// Switch pre-fit mode; recounts the fitted scatterers.
    pub fn set_prefit(&mut self, prefit: bool) {
        self.prefit = prefit;
        self.recount_material();
        self.invalidate_buffers();
    }

    /// Toggle the outlier flag of the measurement at `index`.
    ///
    /// Only the bookkeeping (degrees of freedom and hit counts) changes; the caller updates the
    /// normal equations.
    pub fn set_outlier(&mut self, index: usize, outlier: bool) {
        let Some(meas) = self.states.get_mut(index).and_then(|s| s.measurement_state_mut()) else {
            debug_assert!(false, "state {index} is not a measurement");
            return;
        };
        if meas.outlier == outlier {
            return;
        }
        meas.outlier = outlier;
        let n = meas.n_measured() as i32;
        let kind = *meas.measurement.kind();
        let tube = matches!(kind, MeasurementKind::DriftCircle { .. })
            && meas.errors[LOC1] >= TUBE_HIT_ERROR;
        let pseudo = matches!(kind, MeasurementKind::Pseudo);
        if outlier {
            self.ndof -= n;
            self.n_outliers += 1;
            self.count_hit(kind.category(), pseudo, tube, -1);
        } else {
            self.ndof += n;
            self.n_outliers -= 1;
            self.count_hit(kind.category(), pseudo, tube, 1);
        }
    }

    /// Keep the tube-hit count in sync after a drift hit's error changed from `old_error`.
    pub(crate) fn update_drift_tube_count(&mut self, index: usize, old_error: f64) {
        let Some(meas) = self.states[index].measurement_state() else {
            return;
        };
        let new_error = meas.errors[LOC1];
        if new_error >= TUBE_HIT_ERROR && old_error < TUBE_HIT_ERROR {
            self.n_drift_tube += 1;
        } else if new_error < TUBE_HIT_ERROR && old_error >= TUBE_HIT_ERROR {
            self.n_drift_tube -= 1;
        }
    }

    /// Drop the linearization buffers and the convergence flag.
    pub fn reset(&mut self) {
        self.invalidate_buffers();
        self.converged = false;
        self.chi2 = 0.;
        self.prev_chi2 = 0.;
    }

    fn invalidate_buffers(&mut self) {
        self.residuals = Array1::zeros(0);
        self.errors = Array1::zeros(0);
        self.weighted_derivatives = Array2::zeros((0, 0));
    }

    fn ensure_buffers(&mut self) {
        let rows = self.n_residuals();
        let cols = self.n_fit_parameters();
        if self.residuals.len() != rows {
            self.residuals = Array1::zeros(rows);
            self.errors = Array1::zeros(rows);
        }
        if self.weighted_derivatives.dim() != (rows, cols) {
            self.weighted_derivatives = Array2::zeros((rows, cols));
        }
    }

    /// Residual vector, sized on first access.
    pub fn residuals(&mut self) -> &mut Array1<f64> {
        self.ensure_buffers();
        &mut self.residuals
    }

    /// Error vector, sized on first access.
    pub fn errors(&mut self) -> &mut Array1<f64> {
        self.ensure_buffers();
        &mut self.errors
    }

    /// Weighted residual derivatives (rows: residuals, columns: fit parameters).
    pub fn weighted_derivatives(&mut self) -> &mut Array2<f64> {
        self.ensure_buffers();
        &mut self.weighted_derivatives
    }

    /// All three buffers at once.
    pub(crate) fn buffers(&mut self) -> (&mut Array1<f64>, &mut Array1<f64>, &mut Array2<f64>) {
        self.ensure_buffers();
        (
            &mut self.residuals,
            &mut self.errors,
            &mut self.weighted_derivatives,
        )
    }

    /// Buffers together with the states, for passes that read states and fill rows.
    pub(crate) fn split_mut(
        &mut self,
    ) -> (
        &mut [TrackState],
        &mut Array1<f64>,
        &mut Array1<f64>,
        &mut Array2<f64>,
    ) {
        self.ensure_buffers();
        (
            &mut self.states,
            &mut self.residuals,
            &mut self.errors,
            &mut self.weighted_derivatives,
        )
    }

    /// States in trajectory order.
    pub fn states(&self) -> &[TrackState] {
        &self.states
    }

    pub(crate) fn states_mut(&mut self) -> &mut [TrackState] {
        &mut self.states
    }

    /// Reference (perigee) parameters.
    pub fn reference_parameters(&self) -> Option<&TrackParameters> {
        self.reference.as_ref()
    }

    /// Number of fitted perigee parameters.
    pub fn n_perigee_parameters(&self) -> usize {
        self.n_perigee
    }

    /// Total number of fit parameters.
    pub fn n_fit_parameters(&self) -> usize {
        self.n_perigee + 2 * self.n_scatterers + self.n_brems
    }

    /// Measured scalars of measurement and outlier states.
    pub fn n_measurements(&self) -> usize {
        self.states.iter().map(|s| s.n_measured()).sum()
    }

    /// Residual rows: measured scalars plus one per brem.
    pub fn n_residuals(&self) -> usize {
        self.n_measurements() + self.n_brems
    }

    /// Degrees of freedom.
    pub fn ndof(&self) -> i32 {
        self.ndof
    }

    /// Active measurements.
    pub fn n_hits(&self) -> usize {
        self.n_hits
    }

    /// Outliers.
    pub fn n_outliers(&self) -> usize {
        self.n_outliers
    }

    /// Active silicon measurements.
    pub fn n_silicon_hits(&self) -> usize {
        self.n_silicon
    }

    /// Active drift measurements.
    pub fn n_drift_hits(&self) -> usize {
        self.n_drift
    }

    /// Active drift measurements calibrated as tube hits.
    pub fn n_drift_tube_hits(&self) -> usize {
        self.n_drift_tube
    }

    /// Pseudo-measurements.
    pub fn n_pseudo(&self) -> usize {
        self.n_pseudo
    }

    /// Scatterers with fitted angles.
    pub fn n_scatterers(&self) -> usize {
        self.n_scatterers
    }

    /// Brem points.
    pub fn n_brems(&self) -> usize {
        self.n_brems
    }

    /// Leading states upstream of the reference point.
    pub fn n_upstream_states(&self) -> usize {
        self.n_upstream_states
    }

    /// Upstream scatterers.
    pub fn n_upstream_scatterers(&self) -> usize {
        self.n_upstream_scatterers
    }

    /// Upstream brems.
    pub fn n_upstream_brems(&self) -> usize {
        self.n_upstream_brems
    }

    /// Total thickness in radiation lengths.
    pub fn total_x0(&self) -> f64 {
        self.total_x0
    }

    /// Total absolute energy loss in MeV.
    pub fn total_energy_loss(&self) -> f64 {
        self.total_energy_loss
    }

    /// Whether any material states are present.
    pub fn has_material(&self) -> bool {
        self.states.iter().any(|s| s.material_effect().is_some())
    }

    /// Current chi-square.
    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    /// Chi-square of the previous iteration.
    pub fn prev_chi2(&self) -> f64 {
        self.prev_chi2
    }

    /// Store a new chi-square, keeping the old one as previous.
    pub(crate) fn set_chi2(&mut self, chi2: f64) {
        self.prev_chi2 = self.chi2;
        self.chi2 = chi2;
    }

    /// Overwrite the chi-square without touching the previous value.
    pub(crate) fn force_chi2(&mut self, chi2: f64) {
        self.chi2 = chi2;
    }

    /// Whether the fit converged.
    pub fn converged(&self) -> bool {
        self.converged
    }

    pub(crate) fn set_converged(&mut self, converged: bool) {
        self.converged = converged;
    }

    /// Pre-fit mode.
    pub fn prefit(&self) -> bool {
        self.prefit
    }

    /// Straight-line mode.
    pub fn straight_line(&self) -> bool {
        self.straight_line
    }

    /// Mass hypothesis in MeV.
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Whether every hit is a silicon or drift hit, with at least one silicon hit.
    pub fn is_inner_detector_only(&self) -> bool {
        self.n_silicon != 0 && self.n_silicon + self.n_drift == self.n_hits
    }

    /// Fit-parameter column of the phi angle of the `k`-th scatterer.
    pub(crate) fn scatterer_column(&self, k: usize) -> usize {
        self.n_perigee + 2 * k
    }

    /// Fit-parameter column of the `k`-th brem.
    pub(crate) fn brem_column(&self, k: usize) -> usize {
        self.n_perigee + 2 * self.n_scatterers + k
    }

    /// State indices of the scatterers, in order.
    pub(crate) fn scatterer_states(&self) -> Vec<usize> {
        let prefit = self.prefit;
        (0..self.states.len())
            .filter(|i| self.states[*i].is_scatterer(prefit))
            .collect()
    }

    /// State indices of the brems, in order.
    pub(crate) fn brem_states(&self) -> Vec<usize> {
        (0..self.states.len())
            .filter(|i| self.states[*i].is_brem())
            .collect()
    }

    /// Residual row of the first measured scalar of every state.
    pub(crate) fn measurement_rows(&self) -> Vec<usize> {
        let mut row = 0;
        self.states
            .iter()
            .map(|s| {
                let first = row;
                row += s.n_measured();
                first
            })
            .collect()
    }

    /// Whether the state at `index` is a measurement of kind drift circle.
    pub(crate) fn is_drift(&self, index: usize) -> bool {
        matches!(
            self.states[index].kind(),
            StateKind::Measurement(m) if matches!(m.measurement.kind(), MeasurementKind::DriftCircle { .. })
        )
    }
}
