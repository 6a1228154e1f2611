//! Outlier removal and recalibration during and after the fit.
//!
//! The drift cleaner runs inside the early iterations and edits the normal equations in place.
//! The precision cleaner runs after convergence on silicon-only tracks: it removes the hit with
//! the largest pull on a copy of the trajectory, refits, and keeps whichever version is better.

use log::{debug, info};
use nalgebra::DMatrix;

use crate::error::FitError;
use crate::fitter::Fitter;
use crate::iteration::{FitContext, residual};
use crate::measurement::{MeasurementKind, RawHit};
use crate::normal::NormalEquations;
use crate::parameters::{LOC1, LOC2};
use crate::propagator::Propagator;
use crate::trajectory::{TUBE_HIT_ERROR, Trajectory};

/// Largest precision-hit pull found by a scan of the trajectory.
struct PullScan {
    max_pull: f64,
    index: usize,
    /// Pixels with a pull above the soft cut.
    n3sigma: usize,
}

impl<P: Propagator> Fitter<P> {
    /// Drift-circle cleaning inside the iteration loop: hits predicted outside their tube become
    /// outliers, and hits are switched between precise and tube calibration according to the
    /// distance of the track from the raw drift radius.
    pub(crate) fn clean_drift_hits(
        &self,
        traj: &mut Trajectory,
        ctx: &mut FitContext,
        eq: &mut NormalEquations,
    ) -> Result<(), FitError> {
        let it = ctx.iteration;
        let recalibrate = self.corrector.is_some() && self.broad_corrector.is_some();
        let mut scale = self.config.drift_scale_factor;
        if it == 1 && traj.n_silicon_hits() + traj.n_drift_hits() == traj.n_hits() {
            scale *= 2.;
        }
        let rows = traj.measurement_rows();
        let phi_weights = ctx.weighted_columns(traj);
        let mut changed = false;

        for index in 0..traj.states().len() {
            if !traj.states()[index].is_measurement() || !traj.is_drift(index) {
                continue;
            }
            let state = &traj.states()[index];
            let (Some(params), Some(meas)) = (state.parameters(), state.measurement_state()) else {
                continue;
            };
            let params = params.clone();
            let track_radius = params.values()[LOC1];
            let old_error = meas.errors[LOC1];
            let old_radius = meas.measurement.value(LOC1);
            let tube_radius = match meas.measurement.kind() {
                MeasurementKind::DriftCircle { tube_radius } => *tube_radius,
                _ => continue,
            };
            let row = rows[index];

            if ctx.run_outlier && track_radius.abs() > self.config.drift_acceptance_factor * tube_radius {
                info!(
                    "Drift hit {index} predicted at {track_radius:.3} mm outside its tube, turning it into an outlier."
                );
                traj.set_outlier(index, true);
                let (res, _, wd) = traj.buffers();
                eq.remove_row(wd.row_mut(row), res[row], old_error);
                res[row] = 0.;
                changed = true;
                continue;
            }
            if !recalibrate {
                continue;
            }
            let Some(raw) = meas.measurement.raw().cloned() else {
                continue;
            };
            let distance = (track_radius.abs() - raw.position).abs();
            let corrector = if distance < scale * raw.error
                && (old_error > TUBE_HIT_ERROR || track_radius * old_radius < 0.)
            {
                self.corrector.as_deref()
            } else if distance > scale * raw.error && old_error < TUBE_HIT_ERROR {
                self.broad_corrector.as_deref()
            } else {
                None
            };
            let Some(corrected) = corrector.and_then(|c| c.correct(&meas.measurement, &raw, &params))
            else {
                continue;
            };
            let new_errors = corrected.errors();
            let new_error = new_errors[LOC1];
            if new_error <= 0. {
                continue;
            }
            let new_res = corrected.value(LOC1) - track_radius;
            debug!(
                "Recalibrating drift hit {index}: radius {old_radius:.3} -> {:.3}, error {old_error:.3} -> {new_error:.3}.",
                corrected.value(LOC1)
            );
            if let Some(meas) = traj.states_mut()[index].measurement_state_mut() {
                meas.measurement = corrected;
                meas.errors = new_errors;
                meas.recalibrated = true;
            }
            traj.update_drift_tube_count(index, old_error);
            let (res, err, wd) = traj.buffers();
            eq.rescale_row(wd.row_mut(row), res[row], new_res, old_error, new_error, &phi_weights);
            res[row] = new_res;
            err[row] = new_error;
            changed = true;
        }

        if traj.ndof() < 0 {
            return Err(FitError::OutlierLogicFailure(format!(
                "drift cleaning left {} degrees of freedom",
                traj.ndof()
            )));
        }
        if changed {
            eq.sync();
            traj.set_converged(false);
            ctx.min_iterations = it + 2;
        }
        Ok(())
    }

    fn scan_pulls(&self, traj: &Trajectory, cut2: f64) -> Option<PullScan> {
        let mut scan: Option<PullScan> = None;
        let mut n3sigma = 0;
        for (index, state) in traj.states().iter().enumerate() {
            let Some(meas) = state.measurement_state() else {
                continue;
            };
            if meas.outlier || !meas.measurement.kind().is_precision() {
                continue;
            }
            let (Some(params), Some(cov)) = (state.parameters(), state.track_covariance()) else {
                continue;
            };
            let pixel = matches!(meas.measurement.kind(), MeasurementKind::Pixel);
            let mut pull: f64 = 0.;
            let hit_var = meas.measurement.variance(LOC1).unwrap_or(0.);
            if hit_var > cov[(0, 0)] {
                let track_var = match meas.measurement.kind().stereo() {
                    Some((c, s)) => c * c * cov[(0, 0)] + 2. * c * s * cov[(1, 0)] + s * s * cov[(1, 1)],
                    None => cov[(0, 0)],
                };
                let weight = meas.errors[LOC1].powi(2) - track_var;
                if weight > 0. {
                    pull = pull.max((residual(meas, LOC1, params) / weight.sqrt()).abs());
                }
            }
            if pixel && meas.errors[LOC2] > 0. {
                let hit_var = meas.measurement.variance(LOC2).unwrap_or(0.);
                if hit_var > cov[(1, 1)] {
                    let weight = meas.errors[LOC2].powi(2) - cov[(1, 1)];
                    if weight > 0. {
                        pull = pull.max((residual(meas, LOC2, params) / weight.sqrt()).abs());
                    }
                }
            }
            if pixel && pull > cut2 {
                n3sigma += 1;
            }
            if scan.as_ref().is_none_or(|s| pull > s.max_pull) {
                scan = Some(PullScan {
                    max_pull: pull,
                    index,
                    n3sigma: 0,
                });
            }
        }
        scan.map(|s| PullScan { n3sigma, ..s })
    }

    /// Replace the calibration of precision hit `index` in place with a broad cluster error.
    /// Returns whether the hit was recalibrated.
    fn recalibrate_broad(
        &self,
        traj: &mut Trajectory,
        ctx: &FitContext,
        eq: &mut NormalEquations,
        index: usize,
        raw: &RawHit,
    ) -> bool {
        let Some(broad) = self.broad_corrector.as_deref() else {
            return false;
        };
        let state = &traj.states()[index];
        let (Some(params), Some(meas)) = (state.parameters(), state.measurement_state()) else {
            return false;
        };
        let Some(corrected) = broad.correct(&meas.measurement, raw, params) else {
            return false;
        };
        let new_errors = corrected.errors();
        let components: Vec<usize> = (0..5).filter(|i| meas.errors[*i] > 0.).collect();
        if components.iter().any(|i| new_errors[*i] <= 0.) {
            return false;
        }
        let mut updated = meas.clone();
        updated.measurement = corrected;
        updated.errors = new_errors;
        updated.recalibrated = true;

        let mut new_pull: f64 = 0.;
        let mut wider = false;
        let new_res: Vec<f64> = components
            .iter()
            .map(|&i| {
                let r = residual(&updated, i, params);
                new_pull = new_pull.max((r / new_errors[i]).abs());
                wider |= new_errors[i] > 1.5 * meas.errors[i];
                r
            })
            .collect();
        if new_pull >= self.config.outlier_cut || !wider {
            return false;
        }

        debug!("Recalibrating precision hit {index} with broad errors, new pull {new_pull:.2}.");
        let old_errors = meas.errors;
        let phi_weights = ctx.weighted_columns(traj);
        let row = traj.measurement_rows()[index];
        if let Some(meas) = traj.states_mut()[index].measurement_state_mut() {
            *meas = updated;
        }
        let (res, err, wd) = traj.buffers();
        for (n, &i) in components.iter().enumerate() {
            let r = row + n;
            eq.rescale_row(wd.row_mut(r), res[r], new_res[n], old_errors[i], new_errors[i], &phi_weights);
            res[r] = new_res[n];
            err[r] = new_errors[i];
        }
        eq.sync();
        true
    }

    /// Iterate `traj` until convergence, starting with a parameter update from `eq`.
    pub(crate) fn refit_trajectory(
        &self,
        traj: &mut Trajectory,
        ctx: &mut FitContext,
        eq: &mut NormalEquations,
    ) -> Result<(), FitError> {
        traj.set_converged(false);
        self.update_parameters(traj, eq)?;
        let mut doderiv = false;
        for it in 0..self.config.max_iterations {
            if traj.converged() {
                return Ok(());
            }
            if it + 1 >= self.config.max_iterations {
                break;
            }
            ctx.iteration = it;
            self.run_iteration(traj, ctx, eq, &mut doderiv)?;
            if !traj.converged() {
                self.update_parameters(traj, eq)?;
            }
        }
        Err(FitError::NoConvergence {
            max_iterations: self.config.max_iterations,
            last_chi2: traj.chi2(),
        })
    }

    /// Pull-based cleaning of silicon-only tracks after convergence.
    ///
    /// `cov` is the fit covariance belonging to `eq`; both are replaced when a cleaned
    /// trajectory is accepted.
    pub(crate) fn clean_precision_hits(
        &self,
        traj: &mut Trajectory,
        ctx: &mut FitContext,
        eq: &mut NormalEquations,
        cov: &mut DMatrix<f64>,
    ) -> Result<(), FitError> {
        let cut = self.config.outlier_cut;
        let chi2_cut = self.config.chi2_per_dof_cut;
        let reduced = |t: &Trajectory| {
            if t.ndof() > 0 {
                t.chi2() / t.ndof() as f64
            } else {
                0.
            }
        };

        let mut track_ok = false;
        while !track_ok && traj.ndof() > 0 {
            track_ok = true;
            if traj.n_hits() != traj.n_silicon_hits() {
                return Ok(());
            }
            let n_outliers = traj.n_outliers();
            let cut2 = if n_outliers > 0 { cut - 1.25 } else { cut - 1. };
            let Some(scan) = self.scan_pulls(traj, cut2) else {
                break;
            };
            let old_red = reduced(traj);
            if !(scan.max_pull > 2. && old_red > 0.25 * chi2_cut) {
                break;
            }

            let state = &traj.states()[scan.index];
            let Some(meas) = state.measurement_state() else {
                break;
            };
            let is_strip = matches!(meas.measurement.kind(), MeasurementKind::Strip { .. });
            let raw = meas.measurement.raw().cloned();
            let try_broad = self.broad_corrector.is_some()
                && !meas.recalibrated
                && scan.max_pull > 2.5
                && old_red > 0.3 * chi2_cut;

            if let (Some(raw), true) = (raw, try_broad) {
                if self.recalibrate_broad(traj, ctx, eq, scan.index, &raw) {
                    self.refit_trajectory(traj, ctx, eq)?;
                    if ctx.run_outlier && reduced(traj) > chi2_cut {
                        return Err(FitError::OutlierLogicFailure(format!(
                            "chi2/ndof {:.2} after recalibration",
                            reduced(traj)
                        )));
                    }
                    *cov = eq.covariance()?;
                    self.calculate_track_errors(traj, cov, true);
                    // Other hits may still carry large pulls.
                    track_ok = false;
                    continue;
                }
            }

            let soft = (scan.n3sigma < 2 && scan.max_pull > cut2 && scan.max_pull < cut)
                || scan.n3sigma > 1;
            let remove = ((soft && (old_red > 0.3 * chi2_cut || n_outliers > 1)) || scan.max_pull > cut)
                && (traj.ndof() > 1 || is_strip)
                && ctx.run_outlier;
            if !remove {
                break;
            }
            track_ok = false;

            info!(
                "Removing precision hit {} with pull {:.2} and refitting.",
                scan.index, scan.max_pull
            );
            let mut candidate = traj.clone();
            let mut candidate_eq = eq.clone();
            let old_ndof = traj.ndof();
            let row = candidate.measurement_rows()[scan.index];
            let n_rows = candidate.states()[scan.index].n_measured();
            {
                let (res, err, wd) = candidate.buffers();
                for r in row..row + n_rows {
                    candidate_eq.remove_row(wd.row_mut(r), res[r], err[r]);
                    res[r] = 0.;
                }
            }
            candidate.set_outlier(scan.index, true);
            candidate_eq.sync();
            let mut candidate_ctx = ctx.clone();
            self.refit_trajectory(&mut candidate, &mut candidate_ctx, &mut candidate_eq)?;

            let new_red = reduced(&candidate);
            let mut min_diff = 0.;
            if candidate.ndof() != old_ndof && scan.max_pull > cut2 {
                min_diff = if old_red > 0.33 * chi2_cut || n_outliers > 0 { 0.8 } else { 1. };
                if n_outliers == 0 && scan.max_pull < cut - 0.5 && old_red < 0.5 * chi2_cut {
                    min_diff = 2.;
                }
            }
            if new_red > old_red || (new_red > old_red - min_diff && new_red > 0.33 * old_red) {
                debug!("Outlier not confirmed: chi2/ndof {old_red:.3} -> {new_red:.3}, keeping the hit.");
                if old_red > chi2_cut {
                    return Err(FitError::OutlierLogicFailure(format!(
                        "chi2/ndof {old_red:.2} above the cut and no confirmed outlier"
                    )));
                }
                return Ok(());
            }

            debug!("Outlier confirmed: chi2/ndof {old_red:.3} -> {new_red:.3}.");
            *traj = candidate;
            *eq = candidate_eq;
            *ctx = candidate_ctx;
            *cov = eq.covariance()?;
            self.calculate_track_errors(traj, cov, true);
        }

        if traj.ndof() > 0 && reduced(traj) > chi2_cut && ctx.run_outlier {
            return Err(FitError::OutlierLogicFailure(format!(
                "chi2/ndof {:.2} above the cut after cleaning",
                reduced(traj)
            )));
        }
        Ok(())
    }
}
