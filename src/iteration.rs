//! One Gauss–Newton iteration: propagate, fill residuals and derivatives, assemble and solve.

use std::sync::Arc;

use log::{debug, trace};
use nalgebra::{DMatrix, DVector, Matrix5};

use crate::derivatives::calculate_derivatives;
use crate::error::FitError;
use crate::fitter::Fitter;
use crate::geometry::{Surface, correct_angles, wrap_angle};
use crate::holes::crossings_between;
use crate::material::HEAVY_MASS_THRESHOLD;
use crate::normal::{BremLayout, MeasurementWindows, NormalEquations};
use crate::parameters::{
    FitQuality, LOC1, PHI, QOP_SCALE, QOVERP, THETA, TrackParameters, limit_inverse_p,
};
use crate::propagator::{PropDirection, Propagator};
use crate::state::{MeasurementState, StateKind};
use crate::trajectory::Trajectory;

/// Finite-difference steps of the numerical Jacobian, per parameter.
const NUMERICAL_STEPS: [f64; 5] = [0.01, 0.01, 1e-5, 1e-5, 1e-9];

/// Mutable bookkeeping of one fit, shared by the iteration and the cleaners.
#[derive(Clone, Debug)]
pub(crate) struct FitContext {
    pub run_outlier: bool,
    pub asymmetric: bool,
    pub iteration: usize,
    pub min_iterations: usize,
    /// Current inflation of every scatterer's phi diagonal.
    pub phi_weights: Vec<f64>,
    pub windows: Option<MeasurementWindows>,
    pub chi2_history: Vec<f64>,
    pub updates: usize,
}

impl FitContext {
    pub(crate) fn new(run_outlier: bool, asymmetric: bool, min_iterations: usize) -> Self {
        Self {
            run_outlier,
            asymmetric,
            iteration: 0,
            min_iterations,
            phi_weights: Vec::new(),
            windows: None,
            chi2_history: Vec::new(),
            updates: 0,
        }
    }

    /// `(column, weight)` of the inflated phi diagonals.
    pub(crate) fn weighted_columns(&self, traj: &Trajectory) -> Vec<(usize, f64)> {
        self.phi_weights
            .iter()
            .enumerate()
            .filter(|(_, w)| **w != 1.)
            .map(|(k, w)| (traj.scatterer_column(k), *w))
            .collect()
    }
}

/// `−dE/dq` of `E = √(m² + 1/q²)`, written as `1 / (q² √(1 + m²q²))` with the sign of q.
fn energy_slope(mass: f64, qop: f64) -> f64 {
    (1. / (qop * qop * (1. + mass * mass * qop * qop).sqrt())).copysign(qop)
}

fn energy(mass: f64, qop: f64) -> f64 {
    (mass * mass + 1. / (qop * qop)).sqrt()
}

/// Components a measurement state contributes rows for.
fn measured_components(meas: &MeasurementState) -> impl Iterator<Item = usize> + '_ {
    (0..5).filter(|i| meas.errors[*i] > 0.)
}

/// Residual `measured − predicted` of component `i`, φ wrapped into [−π, π].
pub(crate) fn residual(meas: &MeasurementState, i: usize, params: &TrackParameters) -> f64 {
    let r = meas.measurement.value(i) - meas.measurement.predicted(i, params.values());
    if i == PHI { wrap_angle(r) } else { r }
}

impl<P: Propagator> Fitter<P> {
    /// Numerical transport Jacobian by symmetric differences.
    pub(crate) fn numerical_jacobian(
        &self,
        start: &TrackParameters,
        surface: &Arc<Surface>,
        direction: PropDirection,
    ) -> Option<Matrix5<f64>> {
        let mut jac = Matrix5::identity();
        for (i, eps) in NUMERICAL_STEPS.iter().enumerate() {
            let shifted = |delta: f64| {
                let mut values = *start.values();
                values[i] += delta;
                if let Some((phi, theta)) = correct_angles(values[PHI], values[THETA]) {
                    values[PHI] = phi;
                    values[THETA] = theta;
                }
                start.with_values(values)
            };
            let plus = self
                .propagator
                .propagate(&shifted(*eps), surface, direction, false)?;
            let minus = self
                .propagator
                .propagate(&shifted(-eps), surface, direction, false)?;
            for r in 0..5 {
                let mut diff = plus.parameters.values()[r] - minus.parameters.values()[r];
                if r == PHI {
                    diff = wrap_angle(diff);
                }
                jac[(r, i)] = diff / (2. * eps);
            }
        }
        Some(jac)
    }

    /// Propagate with a fallback to the reversed direction. With `with_jacobian` the transport
    /// Jacobian is returned as well, numerically if the propagator has none.
    pub(crate) fn transport(
        &self,
        start: &TrackParameters,
        surface: &Arc<Surface>,
        direction: PropDirection,
        with_jacobian: bool,
    ) -> Option<(TrackParameters, Option<Matrix5<f64>>)> {
        [direction, direction.reversed()].into_iter().find_map(|dir| {
            let prop = self.propagator.propagate(start, surface, dir, with_jacobian)?;
            if !with_jacobian {
                return Some((prop.parameters, None));
            }
            let jac = match prop.jacobian {
                Some(jac) => jac,
                None => self.numerical_jacobian(start, surface, dir)?,
            };
            Some((prop.parameters, Some(jac)))
        })
    }

    /// Propagate the reference parameters through every state, outwards in both directions,
    /// applying the material effects on the way.
    ///
    /// With `collect_holes` the sensitive crossings between consecutive downstream states are
    /// cached on the earlier state of each pair.
    pub(crate) fn propagate_states(
        &self,
        traj: &mut Trajectory,
        with_jacobian: bool,
        collect_holes: bool,
    ) -> Result<(), FitError> {
        let nup = traj.n_upstream_states();
        let mass = traj.mass();
        let straight = traj.straight_line();
        let reference = traj
            .reference_parameters()
            .cloned()
            .ok_or_else(|| FitError::InvalidInput("trajectory has no reference parameters".into()))?;
        let extrapolator = if collect_holes {
            self.hole_extrapolator.as_deref()
        } else {
            None
        };
        let states = traj.states_mut();

        let mut prev = reference.clone();
        let mut qop_factor = 1.;
        for i in (0..nup).rev() {
            let state = &mut states[i];
            let mut direction = PropDirection::Opposite;
            if i + 1 != nup
                && state
                    .surface
                    .straight_line_path(&prev.position(), &prev.direction())
                    .is_some_and(|d| d > 0.)
            {
                direction = PropDirection::Along;
            }
            let (params, jacobian) = self
                .transport(&prev, &state.surface, direction, with_jacobian)
                .ok_or(FitError::ExtrapolationFailure { state: i })?;
            if let Some(mut jac) = jacobian {
                for r in 0..5 {
                    jac[(r, QOVERP)] *= qop_factor;
                }
                state.jacobian = jac;
            }
            qop_factor = 1.;
            prev = params.clone();
            if let StateKind::Material(effect) = &state.kind {
                if i != 0 {
                    qop_factor = effect.qop_derivative(params.qoverp(), -1., mass);
                    prev = effect.apply(&params, -1., mass, straight)?;
                }
            }
            state.parameters = Some(params);
        }

        prev = reference;
        qop_factor = 1.;
        for i in nup..states.len() {
            let mut direction = PropDirection::Along;
            if i != nup
                && states[i]
                    .surface
                    .straight_line_path(&prev.position(), &prev.direction())
                    .is_some_and(|d| d < 0.)
            {
                direction = PropDirection::Opposite;
            }
            let (params, jacobian) = self
                .transport(&prev, &states[i].surface, direction, with_jacobian)
                .ok_or(FitError::ExtrapolationFailure { state: i })?;

            if let Some(extrapolator) = extrapolator.filter(|_| i > nup) {
                let crossings =
                    crossings_between(extrapolator, &prev, &params, &states[i].surface, direction);
                states[i - 1].holes = Some(crossings);
            }

            let state = &mut states[i];
            if let Some(mut jac) = jacobian {
                for r in 0..5 {
                    jac[(r, QOVERP)] *= qop_factor;
                }
                state.jacobian = jac;
            }
            qop_factor = 1.;
            let mut stored = params;
            if let StateKind::Material(effect) = &state.kind {
                qop_factor = effect.qop_derivative(stored.qoverp(), 1., mass);
                stored = effect.apply(&stored, 1., mass, straight)?;
            }
            prev = stored.clone();
            state.parameters = Some(stored);
        }
        Ok(())
    }

    /// Residuals, errors and chi-square of the current parameters; decides convergence.
    ///
    /// Also runs the kink detection: once the fit has converged, the brem with the most
    /// negative energy pull gets a ten times wider positive error and the fit is reopened.
    pub(crate) fn fill_residuals(
        &self,
        traj: &mut Trajectory,
        ctx: &FitContext,
        eq: &mut NormalEquations,
        doderiv: &mut bool,
    ) -> Result<(), FitError> {
        let n_meas = traj.n_measurements();
        let n_perigee = traj.n_perigee_parameters();
        let prefit = traj.prefit();
        let mass = traj.mass() * QOP_SCALE;
        let ndrift = traj.n_drift_hits();
        let it = ctx.iteration;
        let asymmetric = ctx.asymmetric && it > 0 && !prefit;
        let heavy = traj.mass() > HEAVY_MASS_THRESHOLD;

        let mut chi2 = 0.;
        // State and brem row of the most negative energy pull.
        let mut kink: Option<(usize, usize)> = None;
        let mut max_pull = 0.;
        {
            let (states, res, err, _) = traj.split_mut();
            let (mut row, mut scat, mut brem) = (0, 0, 0);
            for (index, state) in states.iter_mut().enumerate() {
                match &mut state.kind {
                    StateKind::Measurement(meas) => {
                        let params = state
                            .parameters
                            .as_ref()
                            .ok_or(FitError::ExtrapolationFailure { state: index })?;
                        for i in (0..5).filter(|i| meas.errors[*i] > 0.) {
                            err[row] = meas.errors[i];
                            res[row] = if meas.outlier {
                                0.
                            } else {
                                residual(meas, i, params)
                            };
                            row += 1;
                        }
                    }
                    StateKind::Material(effect) => {
                        if effect.is_scatterer(prefit) {
                            let col = n_perigee + 2 * scat;
                            let var_phi = effect.sigma_delta_phi * effect.sigma_delta_phi;
                            let var_theta = effect.sigma_delta_theta * effect.sigma_delta_theta;
                            let dphi = effect.delta_phi - effect.measured_delta_phi;
                            eq.b[col] -= dphi / var_phi;
                            eq.b[col + 1] -= effect.delta_theta / var_theta;
                            chi2 += dphi * dphi / var_phi
                                + effect.delta_theta * effect.delta_theta / var_theta;
                            scat += 1;
                        }
                        if effect.is_brem() {
                            let brow = n_meas + brem;
                            let params = state
                                .parameters
                                .as_ref()
                                .ok_or(FitError::ExtrapolationFailure { state: index })?;
                            let qop_brem = limit_inverse_p(params.qoverp() / QOP_SCALE);
                            let qop = limit_inverse_p(qop_brem - effect.delta_p);
                            res[brow] = QOP_SCALE * effect.delta_e.abs() - energy(mass, qop)
                                + energy(mass, qop_brem);
                            err[brow] = QOP_SCALE * effect.sigma_delta_e;
                            if effect.kink {
                                // Only one kink per track.
                                max_pull = f64::NEG_INFINITY;
                                kink = None;
                            }
                            let sigma = effect.sigma_delta_e;
                            if asymmetric
                                && sigma > 0.
                                && sigma != effect.sigma_delta_e_pos
                                && sigma != effect.sigma_delta_e_neg
                            {
                                let pull = res[brow] / (QOP_SCALE * sigma);
                                if heavy {
                                    if pull < -1. {
                                        effect.sigma_delta_e = effect.sigma_delta_e_pos;
                                    } else if pull > 1. {
                                        effect.sigma_delta_e = effect.sigma_delta_e_neg;
                                    }
                                    err[brow] = QOP_SCALE * effect.sigma_delta_e;
                                } else if (ndrift == 0 || it >= 3)
                                    && !effect.kink
                                    && pull < -0.2
                                    && pull < max_pull
                                {
                                    kink = Some((index, brow));
                                    max_pull = pull;
                                }
                            }
                            brem += 1;
                        }
                    }
                    StateKind::Basic => {}
                }
            }
            chi2 += res
                .iter()
                .zip(err.iter())
                .filter(|(_, e)| **e != 0.)
                .map(|(r, e)| r * r / (e * e))
                .sum::<f64>();
        }

        traj.set_chi2(chi2);
        let ndof = traj.ndof();
        let reduced = |c: f64| if ndof > 0 { c / ndof as f64 } else { c };
        let old_red = reduced(traj.prev_chi2());
        let new_red = reduced(chi2);
        trace!(
            "Iteration {it}: chi2 = {chi2:.6}, previous = {:.6}, ndof = {ndof}.",
            traj.prev_chi2()
        );

        if prefit
            && ((new_red < 2. && it != 0)
                || (new_red < old_red + 0.1 && (new_red - old_red).abs() < 1. && it != 1))
        {
            traj.set_converged(true);
        }
        let base = if traj.is_inner_detector_only() { 1 } else { 2 };
        let min_iterations = base.max(ctx.min_iterations);
        if it >= min_iterations
            && (traj.prev_chi2() - chi2).abs() < self.config.chi2_change_tolerance
        {
            traj.set_converged(true);
        }

        if let (Some((index, brow)), true) = (kink, traj.converged()) {
            let states = traj.states_mut();
            let Some(effect) = states[index].material_effect_mut() else {
                return Ok(());
            };
            effect.sigma_delta_e = 10. * effect.sigma_delta_e_pos;
            effect.kink = true;
            let new_err = QOP_SCALE * effect.sigma_delta_e;
            debug!(
                "Kink at state {index}: energy pull {max_pull:.3}, widening the loss error to {:.3} MeV.",
                effect.sigma_delta_e
            );
            traj.set_converged(false);
            let (_, res, err, wd) = traj.split_mut();
            let old_err = err[brow];
            err[brow] = new_err;
            eq.rescale_row(wd.row_mut(brow), res[brow], res[brow], old_err, new_err, &[]);
            eq.sync();
            traj.force_chi2(1e15);
            *doderiv = true;
        }
        Ok(())
    }

    /// Weighted residual derivatives of the measurement and brem rows.
    pub(crate) fn fill_derivatives(&self, traj: &mut Trajectory) {
        let n_meas = traj.n_measurements();
        let n_perigee = traj.n_perigee_parameters();
        let n_scat_up = traj.n_upstream_scatterers();
        let n_brem_up = traj.n_upstream_brems();
        let first_brem = traj.brem_column(0);
        let prefit = traj.prefit();
        let mass = traj.mass() * QOP_SCALE;

        let (states, _, err, wd) = traj.split_mut();
        let (mut row, mut scat, mut brem) = (0, 0, 0);
        for state in states.iter() {
            let scat_range = scat.min(n_scat_up)..scat.max(n_scat_up);
            let brem_range = brem.min(n_brem_up)..brem.max(n_brem_up);
            match &state.kind {
                StateKind::Measurement(meas) => {
                    let stereo = meas.measurement.kind().stereo();
                    let d = &state.derivatives;
                    for i in measured_components(meas) {
                        let mut wrow = wd.row_mut(row);
                        wrow.fill(0.);
                        if !meas.outlier && d.ncols() == wrow.len() {
                            let e = err[row];
                            let deriv = |col: usize| match stereo {
                                Some((cos, sin)) if i == LOC1 => {
                                    cos * d[(0, col)] + sin * d[(1, col)]
                                }
                                _ => d[(i, col)],
                            };
                            let columns = (0..n_perigee)
                                .chain(scat_range.clone().flat_map(|j| {
                                    let col = n_perigee + 2 * j;
                                    [col, col + 1]
                                }))
                                .chain(brem_range.clone().map(|j| first_brem + j));
                            for col in columns {
                                wrow[col] = deriv(col) / e;
                            }
                        }
                        row += 1;
                    }
                }
                StateKind::Material(effect) => {
                    if effect.is_scatterer(prefit) {
                        scat += 1;
                    }
                    if effect.is_brem() {
                        let brow = n_meas + brem;
                        let e = err[brow];
                        let qop_brem = state
                            .parameters
                            .as_ref()
                            .map_or(0., |p| limit_inverse_p(p.qoverp() / QOP_SCALE));
                        let qop = limit_inverse_p(qop_brem - effect.delta_p);
                        let qop_term = energy_slope(mass, qop) / e;
                        let brem_term = energy_slope(mass, qop_brem) / e;

                        let mut wrow = wd.row_mut(brow);
                        wrow.fill(0.);
                        if n_perigee == 5 {
                            wrow[QOVERP] = brem_term - qop_term;
                        }
                        if brem < n_brem_up {
                            wrow[first_brem + brem] = qop_term;
                            for other in brem + 1..n_brem_up {
                                wrow[first_brem + other] = qop_term - brem_term;
                            }
                        } else {
                            wrow[first_brem + brem] = brem_term;
                            for other in n_brem_up..brem {
                                wrow[first_brem + other] = brem_term - qop_term;
                            }
                        }
                        brem += 1;
                    }
                }
                StateKind::Basic => {}
            }
        }
    }

    /// One iteration. `doderiv` selects a full rebuild of the derivatives and of `A`; it is
    /// switched off once the chi-square behaves.
    pub(crate) fn run_iteration(
        &self,
        traj: &mut Trajectory,
        ctx: &mut FitContext,
        eq: &mut NormalEquations,
        doderiv: &mut bool,
    ) -> Result<(), FitError> {
        let it = ctx.iteration;
        let prefit = traj.prefit();
        let ndof = traj.ndof();
        let reduced = |c: f64| if ndof > 0 { c / ndof as f64 } else { c };
        let old_red = reduced(traj.chi2());

        self.propagate_states(traj, *doderiv, false)?;
        eq.b.fill(0.);
        self.fill_residuals(traj, ctx, eq, doderiv)?;
        let new_red = reduced(traj.chi2());

        if prefit && traj.converged() {
            return Ok(());
        }
        if *doderiv {
            calculate_derivatives(traj);
            self.fill_derivatives(traj);
        }

        let windows = ctx
            .windows
            .get_or_insert_with(|| MeasurementWindows::new(traj))
            .clone();
        let brems = BremLayout::new(traj);
        let scatterers = traj.scatterer_states();
        let priors: Vec<(usize, f64, f64)> = scatterers
            .iter()
            .enumerate()
            .filter_map(|(k, &index)| {
                let effect = traj.states()[index].material_effect()?;
                Some((
                    traj.scatterer_column(k),
                    effect.sigma_delta_phi,
                    effect.sigma_delta_theta,
                ))
            })
            .collect();
        {
            let (res, err, wd) = traj.buffers();
            eq.accumulate_gradient(res.view(), err.view(), wd.view(), &windows, brems);
            if *doderiv {
                eq.assemble(wd.view(), &windows, brems, &priors);
            }
        }

        if ctx.phi_weights.len() != scatterers.len() {
            ctx.phi_weights = vec![1.; scatterers.len()];
        }
        let weight = self.config.phi_weight(it);
        let mut weights_changed = false;
        for (k, &index) in scatterers.iter().enumerate() {
            let state = &traj.states()[index];
            let Some(effect) = state.material_effect() else {
                continue;
            };
            if effect.delta_e == 0. || (!prefit && !state.surface().is_line()) {
                let col = traj.scatterer_column(k);
                if !*doderiv {
                    eq.a[(col, col)] /= ctx.phi_weights[k];
                }
                weights_changed |= ctx.phi_weights[k] != weight;
                ctx.phi_weights[k] = weight;
                eq.a[(col, col)] *= weight;
            }
        }
        if *doderiv || weights_changed {
            eq.sync();
        }

        if traj.converged() && !prefit && traj.n_silicon_hits() + traj.n_drift_hits() != traj.n_hits()
        {
            for (k, weight) in ctx.phi_weights.iter_mut().enumerate() {
                let col = traj.scatterer_column(k);
                eq.a[(col, col)] /= *weight;
                *weight = 1.;
            }
            eq.sync();
            return Ok(());
        }

        if it < 5
            && (new_red < 2. || (new_red < old_red && new_red > old_red - 0.5))
            && !prefit
        {
            *doderiv = false;
        }
        Ok(())
    }

    /// Solve the normal equations and apply the step to the reference parameters and the
    /// material nuisance parameters.
    pub(crate) fn update_parameters(
        &self,
        traj: &mut Trajectory,
        eq: &NormalEquations,
    ) -> Result<(), FitError> {
        let x: DVector<f64> = eq.solve()?;
        let n_perigee = traj.n_perigee_parameters();
        let reference = traj
            .reference_parameters()
            .cloned()
            .ok_or_else(|| FitError::InvalidInput("trajectory has no reference parameters".into()))?;

        let mut values = *reference.values();
        for i in 0..4 {
            values[i] += x[i];
        }
        values[QOVERP] = if traj.straight_line() {
            0.
        } else if n_perigee == 5 {
            values[QOVERP] + QOP_SCALE * x[QOVERP]
        } else {
            values[QOVERP]
        };
        let (phi, theta) = correct_angles(values[PHI], values[THETA]).ok_or(
            FitError::InvalidAngles {
                phi: values[PHI],
                theta: values[THETA],
            },
        )?;
        values[PHI] = phi;
        values[THETA] = theta;
        traj.set_reference_parameters(reference.with_values(values));

        for (k, index) in traj.scatterer_states().into_iter().enumerate() {
            let col = traj.scatterer_column(k);
            if let Some(effect) = traj.states_mut()[index].material_effect_mut() {
                effect.delta_phi += x[col];
                effect.delta_theta += x[col + 1];
            }
        }
        for (k, index) in traj.brem_states().into_iter().enumerate() {
            let col = traj.brem_column(k);
            if let Some(effect) = traj.states_mut()[index].material_effect_mut() {
                effect.delta_p += x[col];
            }
        }
        Ok(())
    }

    /// Track covariances at every non-material state from the fit covariance `cov`.
    ///
    /// With `only_local` each state gets `D C Dᵀ`. Otherwise the covariance of a measurement
    /// directly following another is transported with the Jacobian, clamped to the measurement
    /// covariance where the track is less precise than the hit, and attached to the parameters
    /// together with a per-state fit quality.
    pub(crate) fn calculate_track_errors(
        &self,
        traj: &mut Trajectory,
        cov: &DMatrix<f64>,
        only_local: bool,
    ) {
        let nup = traj.n_upstream_states();
        let straight = traj.straight_line();
        let ndof = traj.ndof();
        let order: Vec<usize> = (0..nup).rev().chain(nup..traj.states().len()).collect();
        let states = traj.states_mut();

        let mut prev: Option<usize> = None;
        for (pos, &index) in order.iter().enumerate() {
            if pos == 0 || pos == nup {
                prev = None;
            }
            if states[index].material_effect().is_some() {
                prev = Some(index);
                continue;
            }

            let transported = prev.and_then(|p| {
                let previous = &states[p];
                if only_local || previous.measurement_state().is_none() {
                    return None;
                }
                let prev_cov = previous.track_covariance?;
                let jac = &states[index].jacobian;
                Some(jac * prev_cov * jac.transpose())
            });
            let state = &mut states[index];
            let mut track_cov = match transported {
                Some(c) => c,
                None if state.derivatives.ncols() == cov.nrows() => {
                    let d = &state.derivatives;
                    Matrix5::from_iterator((d * cov * d.transpose()).iter().copied())
                }
                None => Matrix5::zeros(),
            };

            if !only_local {
                let mut error_ok = true;
                if let StateKind::Measurement(meas) = &state.kind {
                    let active = !meas.outlier;
                    let mut clamped = Vec::new();
                    for i in measured_components(meas) {
                        let Some(variance) = meas.measurement.variance(i) else {
                            continue;
                        };
                        if active && track_cov[(i, i)] > variance {
                            error_ok = false;
                            let scale = (variance / track_cov[(i, i)]).sqrt();
                            for k in (0..5).filter(|k| *k != i) {
                                track_cov[(k, i)] *= scale;
                                track_cov[(i, k)] *= scale;
                            }
                            track_cov[(i, i)] = variance;
                            clamped.push(i);
                        }
                    }
                    for (n, &i) in clamped.iter().enumerate() {
                        for &j in &clamped[n + 1..] {
                            if let Some(c) = measurement_covariance(meas, i, j) {
                                track_cov[(i, j)] = c;
                                track_cov[(j, i)] = c;
                            }
                        }
                    }
                }
                if straight {
                    track_cov[(4, 4)] = 1e-20;
                }
                if let Some(params) = state.parameters.take() {
                    state.parameters = Some(params.with_covariance(track_cov));
                }
                state.fit_quality = match &state.kind {
                    StateKind::Measurement(meas) if !meas.outlier => {
                        let n = meas.n_measured() as i32;
                        Some(match state.parameters.as_ref() {
                            Some(params) if error_ok && ndof > 0 => {
                                state_chi2(meas, params, &track_cov).unwrap_or(FitQuality::new(0., n))
                            }
                            _ => FitQuality::new(0., n),
                        })
                    }
                    _ => None,
                };
            }
            state.track_covariance = Some(track_cov);
            prev = Some(index);
        }
    }
}

/// Covariance entry of the measurement between parameters `i` and `j`.
fn measurement_covariance(meas: &MeasurementState, i: usize, j: usize) -> Option<f64> {
    let key = meas.measurement.key();
    let ri = key.indices().position(|k| k == i)?;
    let rj = key.indices().position(|k| k == j)?;
    Some(meas.measurement.covariance()[(ri, rj)])
}

/// Chi-square of one measurement against the fitted track: `rᵀ (V − H C Hᵀ)⁻¹ r`.
fn state_chi2(
    meas: &MeasurementState,
    params: &TrackParameters,
    track_cov: &Matrix5<f64>,
) -> Option<FitQuality> {
    let components: Vec<usize> = measured_components(meas).collect();
    let n = components.len();
    let stereo = meas.measurement.kind().stereo();
    let mut h = DMatrix::zeros(n, 5);
    let mut r = DVector::zeros(n);
    let mut v = DMatrix::zeros(n, n);
    for (a, &i) in components.iter().enumerate() {
        match stereo {
            Some((cos, sin)) if i == LOC1 => {
                h[(a, 0)] = cos;
                h[(a, 1)] = sin;
            }
            _ => h[(a, i)] = 1.,
        }
        r[a] = residual(meas, i, params);
        for (b, &j) in components.iter().enumerate() {
            v[(a, b)] = measurement_covariance(meas, i, j)?;
        }
    }
    let c = DMatrix::from_iterator(5, 5, track_cov.iter().copied());
    let residual_cov = v - &h * c * h.transpose();
    let inverse = residual_cov.try_inverse()?;
    let chi2 = (r.transpose() * inverse * &r)[(0, 0)];
    Some(FitQuality::new(chi2, n as i32))
}
