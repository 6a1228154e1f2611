//! One node of a trajectory.

use std::sync::Arc;

use nalgebra::{DMatrix, Matrix5, Vector3};

use crate::geometry::Surface;
use crate::material::MaterialEffect;
use crate::measurement::Measurement;
use crate::parameters::{FitQuality, TrackParameters};

/// Measurement payload of a state.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementState {
    /// The calibrated measurement.
    pub measurement: Measurement,
    /// Error per track parameter; zero where nothing is measured.
    pub errors: [f64; 5],
    /// Whether the measurement is excluded from the fit.
    pub outlier: bool,
    /// Whether a cleaner already replaced the calibration.
    pub recalibrated: bool,
}

impl MeasurementState {
    /// Number of scalars the measurement contributes.
    pub fn n_measured(&self) -> usize {
        self.errors.iter().filter(|e| **e > 0.).count()
    }
}

/// What a state represents. A state is exactly one of these.
#[derive(Clone, Debug, PartialEq)]
pub enum StateKind {
    /// A measurement or outlier.
    Measurement(MeasurementState),
    /// A material interaction.
    Material(MaterialEffect),
    /// A reference point without measurement or material.
    Basic,
}

/// A node of a [`Trajectory`](crate::trajectory::Trajectory).
#[derive(Clone, Debug)]
pub struct TrackState {
    pub(crate) kind: StateKind,
    pub(crate) surface: Arc<Surface>,
    /// Approximate global position, used for ordering before the first propagation.
    pub(crate) position: Vector3<f64>,
    pub(crate) parameters: Option<TrackParameters>,
    /// Transport Jacobian from the previously propagated state.
    pub(crate) jacobian: Matrix5<f64>,
    /// d(local parameters)/d(fit parameters), 5 × n.
    pub(crate) derivatives: DMatrix<f64>,
    pub(crate) track_covariance: Option<Matrix5<f64>>,
    pub(crate) fit_quality: Option<FitQuality>,
    /// Sensitive crossings between this state and the next, cached for the hole search.
    pub(crate) holes: Option<Vec<TrackParameters>>,
}

impl TrackState {
    fn with_kind(kind: StateKind, surface: Arc<Surface>, position: Vector3<f64>) -> Self {
        Self {
            kind,
            surface,
            position,
            parameters: None,
            jacobian: Matrix5::identity(),
            derivatives: DMatrix::zeros(5, 0),
            track_covariance: None,
            fit_quality: None,
            holes: None,
        }
    }

    /// Measurement state; components with non-positive variance are dropped.
    pub fn measurement(measurement: Measurement) -> Self {
        let errors = measurement.errors();
        let position = measurement.position();
        let surface = measurement.surface().clone();
        Self::with_kind(
            StateKind::Measurement(MeasurementState {
                measurement,
                errors,
                outlier: false,
                recalibrated: false,
            }),
            surface,
            position,
        )
    }

    /// Outlier state.
    pub fn outlier(measurement: Measurement) -> Self {
        let mut state = Self::measurement(measurement);
        if let StateKind::Measurement(m) = &mut state.kind {
            m.outlier = true;
        }
        state
    }

    /// Material state at `position` on `surface`.
    pub fn material(effect: MaterialEffect, surface: Arc<Surface>, position: Vector3<f64>) -> Self {
        Self::with_kind(StateKind::Material(effect), surface, position)
    }

    /// Reference state.
    pub fn basic(parameters: TrackParameters) -> Self {
        let mut state = Self::with_kind(
            StateKind::Basic,
            parameters.surface().clone(),
            parameters.position(),
        );
        state.parameters = Some(parameters);
        state
    }

    /// What the state represents.
    pub fn kind(&self) -> &StateKind {
        &self.kind
    }

    /// Surface of the state.
    pub fn surface(&self) -> &Arc<Surface> {
        &self.surface
    }

    /// Parameters from the last propagation.
    pub fn parameters(&self) -> Option<&TrackParameters> {
        self.parameters.as_ref()
    }

    /// Global position (parameters if propagated, else the construction estimate).
    pub fn position(&self) -> Vector3<f64> {
        self.parameters
            .as_ref()
            .map_or(self.position, |p| p.position())
    }

    /// Measurement payload, for measurements and outliers.
    pub fn measurement_state(&self) -> Option<&MeasurementState> {
        match &self.kind {
            StateKind::Measurement(m) => Some(m),
            _ => None,
        }
    }

    pub(crate) fn measurement_state_mut(&mut self) -> Option<&mut MeasurementState> {
        match &mut self.kind {
            StateKind::Measurement(m) => Some(m),
            _ => None,
        }
    }

    /// Material payload.
    pub fn material_effect(&self) -> Option<&MaterialEffect> {
        match &self.kind {
            StateKind::Material(m) => Some(m),
            _ => None,
        }
    }

    pub(crate) fn material_effect_mut(&mut self) -> Option<&mut MaterialEffect> {
        match &mut self.kind {
            StateKind::Material(m) => Some(m),
            _ => None,
        }
    }

    /// Whether this is an active (non-outlier) measurement.
    pub fn is_measurement(&self) -> bool {
        matches!(&self.kind, StateKind::Measurement(m) if !m.outlier)
    }

    /// Whether this is an outlier.
    pub fn is_outlier(&self) -> bool {
        matches!(&self.kind, StateKind::Measurement(m) if m.outlier)
    }

    /// Whether this state carries fitted scattering angles.
    pub fn is_scatterer(&self, prefit: bool) -> bool {
        self.material_effect().is_some_and(|m| m.is_scatterer(prefit))
    }

    /// Whether this state carries a fitted momentum kick.
    pub fn is_brem(&self) -> bool {
        self.material_effect().is_some_and(|m| m.is_brem())
    }

    /// Number of residual rows the state owns (outliers keep their rows).
    pub fn n_measured(&self) -> usize {
        self.measurement_state().map_or(0, |m| m.n_measured())
    }

    /// Per-state fit quality, available after the final error computation.
    pub fn fit_quality(&self) -> Option<FitQuality> {
        self.fit_quality
    }

    /// Track covariance at the state, available after the error computation.
    pub fn track_covariance(&self) -> Option<&Matrix5<f64>> {
        self.track_covariance.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector5;

    use super::*;
    use crate::geometry::SurfaceId;

    #[test]
    fn kinds_are_exclusive() {
        let plane = Arc::new(Surface::plane(
            SurfaceId(1),
            Vector3::new(10., 0., 0.),
            Vector3::x(),
            Vector3::y(),
        ));
        let hit = TrackState::measurement(Measurement::pixel(plane.clone(), 0., 0., 0.01, 0.1));
        assert!(hit.is_measurement() && !hit.is_outlier() && hit.material_effect().is_none());
        assert_eq!(hit.n_measured(), 2);

        let outlier = TrackState::outlier(Measurement::strip(plane.clone(), 0., 0.02, 0.));
        assert!(outlier.is_outlier() && !outlier.is_measurement());
        assert_eq!(outlier.n_measured(), 1);

        let material = TrackState::material(
            MaterialEffect::new(0.01).with_scattering(1e-3, 1e-3),
            plane.clone(),
            Vector3::new(10., 0., 0.),
        );
        assert!(material.is_scatterer(false) && !material.is_brem());
        assert_eq!(material.n_measured(), 0);

        let basic = TrackState::basic(TrackParameters::new(plane, Vector5::zeros()));
        assert!(matches!(basic.kind(), StateKind::Basic));
        assert!(basic.parameters().is_some());
    }
}
