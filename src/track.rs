//! The fitted track handed back to the caller.

use std::sync::Arc;

use ndarray::Array2;

use crate::geometry::Surface;
use crate::holes::HoleCount;
use crate::material::{MaterialEffect, ParticleHypothesis};
use crate::measurement::Measurement;
use crate::parameters::{FitQuality, TrackParameters};
use crate::state::TrackState;

/// What a fitted state represents.
#[derive(Clone, Debug, PartialEq)]
pub enum FittedStateKind {
    /// A measurement used in the fit.
    Measurement(Measurement),
    /// A measurement rejected by the fit.
    Outlier(Measurement),
    /// A material interaction, with its fitted angles and momentum kick.
    Material(MaterialEffect),
    /// The perigee at the reference point.
    Perigee,
}

/// One state of a fitted track.
#[derive(Clone, Debug)]
pub struct FittedState {
    pub(crate) kind: FittedStateKind,
    pub(crate) surface: Arc<Surface>,
    pub(crate) parameters: Option<TrackParameters>,
    pub(crate) fit_quality: Option<FitQuality>,
}

impl FittedState {
    /// What the state represents.
    pub fn kind(&self) -> &FittedStateKind {
        &self.kind
    }

    /// Surface of the state.
    pub fn surface(&self) -> &Arc<Surface> {
        &self.surface
    }

    /// Fitted parameters, with covariance if the per-state errors were computed.
    pub fn parameters(&self) -> Option<&TrackParameters> {
        self.parameters.as_ref()
    }

    /// Chi-square contribution of a measurement.
    pub fn fit_quality(&self) -> Option<FitQuality> {
        self.fit_quality
    }

    /// The measurement of a measurement or outlier state.
    pub fn measurement(&self) -> Option<&Measurement> {
        match &self.kind {
            FittedStateKind::Measurement(m) | FittedStateKind::Outlier(m) => Some(m),
            _ => None,
        }
    }

    /// Whether the state is an outlier.
    pub fn is_outlier(&self) -> bool {
        matches!(self.kind, FittedStateKind::Outlier(_))
    }

    /// Material of a material state.
    pub fn material_effect(&self) -> Option<&MaterialEffect> {
        match &self.kind {
            FittedStateKind::Material(m) => Some(m),
            _ => None,
        }
    }

    /// Input state for another fit: measurements keep their outlier flag, material keeps its
    /// priors but not its fitted values, the perigee is dropped.
    pub(crate) fn to_track_state(&self) -> Option<TrackState> {
        match &self.kind {
            FittedStateKind::Measurement(m) => Some(TrackState::measurement(m.clone())),
            FittedStateKind::Outlier(m) => Some(TrackState::outlier(m.clone())),
            FittedStateKind::Material(effect) => {
                let mut effect = effect.clone();
                effect.delta_phi = 0.;
                effect.delta_theta = 0.;
                effect.delta_p = 0.;
                let position = self
                    .parameters
                    .as_ref()
                    .map_or(*self.surface.center(), |p| p.position());
                Some(TrackState::material(effect, self.surface.clone(), position))
            }
            FittedStateKind::Perigee => None,
        }
    }
}

/// Result of a successful fit.
///
/// States are ordered along the track, with the perigee inserted at the reference point.
#[derive(Clone, Debug)]
pub struct Track {
    pub(crate) states: Vec<FittedState>,
    pub(crate) perigee: TrackParameters,
    pub(crate) fit_quality: FitQuality,
    pub(crate) particle: ParticleHypothesis,
    pub(crate) straight_line: bool,
    pub(crate) holes: Option<HoleCount>,
    pub(crate) iterations: usize,
    pub(crate) chi2_history: Vec<f64>,
    pub(crate) covariance: Array2<f64>,
    pub(crate) derivatives: Array2<f64>,
}

impl Track {
    /// All states, along the track.
    pub fn states(&self) -> &[FittedState] {
        &self.states
    }

    /// Fitted perigee with its covariance.
    pub fn perigee(&self) -> &TrackParameters {
        &self.perigee
    }

    /// Total chi-square and degrees of freedom.
    pub fn fit_quality(&self) -> FitQuality {
        self.fit_quality
    }

    /// Particle hypothesis of the fit.
    pub fn particle(&self) -> ParticleHypothesis {
        self.particle
    }

    /// Whether q/p was fixed to zero.
    pub fn is_straight_line(&self) -> bool {
        self.straight_line
    }

    /// Hole search result, if the search ran.
    pub fn holes(&self) -> Option<&HoleCount> {
        self.holes.as_ref()
    }

    /// Number of parameter updates.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Chi-square after every iteration of the main loop.
    pub fn chi2_history(&self) -> &[f64] {
        &self.chi2_history
    }

    /// Covariance of all fit parameters: perigee, scattering angles, then brem kicks.
    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    /// Derivatives of the active measurement scalars with respect to the fit parameters.
    pub fn derivative_matrix(&self) -> &Array2<f64> {
        &self.derivatives
    }

    /// Measurements used in the fit.
    pub fn measurements(&self) -> impl Iterator<Item = &Measurement> {
        self.states.iter().filter_map(|s| match &s.kind {
            FittedStateKind::Measurement(m) => Some(m),
            _ => None,
        })
    }

    /// Measurements rejected by the fit.
    pub fn outliers(&self) -> impl Iterator<Item = &Measurement> {
        self.states.iter().filter_map(|s| match &s.kind {
            FittedStateKind::Outlier(m) => Some(m),
            _ => None,
        })
    }

    /// Material crossed by the track.
    pub fn material_effects(&self) -> impl Iterator<Item = &MaterialEffect> {
        self.states.iter().filter_map(FittedState::material_effect)
    }

    /// Whether a hard brem was found.
    pub fn has_kink(&self) -> bool {
        self.material_effects().any(|m| m.kink)
    }

    pub(crate) fn hit_states(&self) -> Vec<TrackState> {
        self.states
            .iter()
            .filter(|s| s.measurement().is_some())
            .filter_map(FittedState::to_track_state)
            .collect()
    }

    pub(crate) fn material_states(&self) -> Vec<TrackState> {
        self.states
            .iter()
            .filter(|s| s.material_effect().is_some())
            .filter_map(FittedState::to_track_state)
            .collect()
    }
}
