//! Calibrated measurements and their capability table.
//!
//! Detector technologies differ only in which local parameters they measure and how the
//! measured scalar is formed from the track parameters. [`MeasurementKind`] is the tag;
//! the per-kind behaviour is a handful of `match` arms instead of a class hierarchy.

use std::sync::Arc;

use log::warn;
use nalgebra::{DMatrix, Vector5};

use crate::geometry::{DetectorCategory, ElementId, Surface};
use crate::parameters::{LOC1, LOC2, TrackParameters};

/// Technology-specific tag of a measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MeasurementKind {
    /// Two-dimensional silicon pixel cluster (loc1, loc2).
    Pixel,
    /// Silicon strip cluster; measures `cos(a) * loc1 + sin(a) * loc2` with `sin(a) = sin_stereo`.
    Strip {
        /// Sine of the stereo angle of the strips.
        sin_stereo: f64,
    },
    /// Signed drift radius around a wire.
    DriftCircle {
        /// Radius of the tube.
        tube_radius: f64,
    },
    /// Muon chamber hit measuring the parameters in its key.
    Muon,
    /// Artificial constraint on arbitrary parameters.
    Pseudo,
    /// Vertex or beam-spot constraint on a perigee surface.
    Vertex,
    /// Multi-dimensional segment; several segments may share a surface.
    Segment,
}

impl MeasurementKind {
    /// Detector category for hit counting.
    pub fn category(&self) -> DetectorCategory {
        match self {
            Self::Pixel => DetectorCategory::Pixel,
            Self::Strip { .. } => DetectorCategory::Strip,
            Self::DriftCircle { .. } => DetectorCategory::Drift,
            Self::Muon | Self::Segment => DetectorCategory::Muon,
            Self::Pseudo | Self::Vertex => DetectorCategory::Other,
        }
    }

    /// Silicon precision measurement handled by the pull cleaner.
    pub fn is_precision(&self) -> bool {
        matches!(self, Self::Pixel | Self::Strip { .. })
    }

    /// Whether a second measurement with the same key may sit on the same surface.
    pub fn allows_shared_surface(&self) -> bool {
        matches!(self, Self::Segment)
    }

    /// Stereo rotation `(cos, sin)` of a strip measurement.
    pub fn stereo(&self) -> Option<(f64, f64)> {
        match self {
            Self::Strip { sin_stereo } if *sin_stereo != 0. => {
                Some(((1. - sin_stereo * sin_stereo).sqrt(), *sin_stereo))
            }
            _ => None,
        }
    }
}

/// Bitmask over the five track parameters a measurement constrains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParameterKey(pub u8);

impl ParameterKey {
    /// Only loc1.
    pub const LOC1: Self = Self(0b00001);
    /// loc1 and loc2.
    pub const LOC12: Self = Self(0b00011);

    /// Key from a list of parameter indices.
    pub fn from_indices(indices: &[usize]) -> Self {
        Self(indices.iter().fold(0, |acc, i| acc | (1 << i)))
    }

    /// Whether parameter `index` is measured.
    pub fn contains(self, index: usize) -> bool {
        self.0 & (1 << index) != 0
    }

    /// Number of measured parameters.
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether no parameter is measured.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Measured parameter indices in ascending order.
    pub fn indices(self) -> impl Iterator<Item = usize> {
        (0..5).filter(move |i| self.contains(*i))
    }
}

/// Uncalibrated hit data a [`MeasurementCorrector`] can turn into a new measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct RawHit {
    /// Element the hit was recorded on.
    pub element: Option<ElementId>,
    /// Unsigned drift radius or cluster position, depending on the technology.
    pub position: f64,
    /// Intrinsic error of the position.
    pub error: f64,
}

/// A calibrated measurement on a surface.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    surface: Arc<Surface>,
    kind: MeasurementKind,
    key: ParameterKey,
    values: Vector5<f64>,
    /// Covariance over the measured parameters, in key order.
    covariance: DMatrix<f64>,
    raw: Option<RawHit>,
}

impl Measurement {
    /// Generic constructor. `values` is indexed by parameter; only keyed entries are read.
    /// `covariance` is square with one row per measured parameter.
    ///
    /// Returns `None` if the covariance does not match the key.
    pub fn new(
        surface: Arc<Surface>,
        kind: MeasurementKind,
        key: ParameterKey,
        values: Vector5<f64>,
        covariance: DMatrix<f64>,
    ) -> Option<Self> {
        if key.is_empty() || covariance.nrows() != key.len() || !covariance.is_square() {
            return None;
        }
        Some(Self {
            surface,
            kind,
            key,
            values,
            covariance,
            raw: None,
        })
    }

    /// Pixel cluster at `(loc1, loc2)` with independent errors.
    pub fn pixel(surface: Arc<Surface>, loc1: f64, loc2: f64, sigma1: f64, sigma2: f64) -> Self {
        Self {
            surface,
            kind: MeasurementKind::Pixel,
            key: ParameterKey::LOC12,
            values: Vector5::new(loc1, loc2, 0., 0., 0.),
            covariance: DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![
                sigma1 * sigma1,
                sigma2 * sigma2,
            ])),
            raw: None,
        }
    }

    /// Strip cluster measuring the rotated coordinate `w`.
    pub fn strip(surface: Arc<Surface>, w: f64, sigma: f64, sin_stereo: f64) -> Self {
        Self {
            surface,
            kind: MeasurementKind::Strip { sin_stereo },
            key: ParameterKey::LOC1,
            values: Vector5::new(w, 0., 0., 0., 0.),
            covariance: DMatrix::from_element(1, 1, sigma * sigma),
            raw: None,
        }
    }

    /// Drift circle with signed radius `radius` on a wire surface.
    pub fn drift_circle(surface: Arc<Surface>, radius: f64, sigma: f64) -> Self {
        let tube_radius = surface.tube_radius().unwrap_or(f64::INFINITY);
        Self {
            surface,
            kind: MeasurementKind::DriftCircle { tube_radius },
            key: ParameterKey::LOC1,
            values: Vector5::new(radius, 0., 0., 0., 0.),
            covariance: DMatrix::from_element(1, 1, sigma * sigma),
            raw: None,
        }
        .with_raw(RawHit {
            element: None,
            position: radius.abs(),
            error: sigma,
        })
    }

    /// Attach raw data for recalibration.
    pub fn with_raw(mut self, raw: RawHit) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Surface of the measurement.
    pub fn surface(&self) -> &Arc<Surface> {
        &self.surface
    }

    /// Kind tag.
    pub fn kind(&self) -> &MeasurementKind {
        &self.kind
    }

    /// Measured parameters.
    pub fn key(&self) -> ParameterKey {
        self.key
    }

    /// Parameter-indexed values.
    pub fn values(&self) -> &Vector5<f64> {
        &self.values
    }

    /// Covariance in key order.
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Raw data, if available.
    pub fn raw(&self) -> Option<&RawHit> {
        self.raw.as_ref()
    }

    /// Category of the measurement.
    pub fn category(&self) -> DetectorCategory {
        self.kind.category()
    }

    /// Errors per track parameter; entries that are not measured, or whose variance is not
    /// positive, are zero.
    pub fn errors(&self) -> [f64; 5] {
        let mut errors = [0.; 5];
        for (row, index) in self.key.indices().enumerate() {
            let variance = self.covariance[(row, row)];
            if variance.is_finite() && variance > 0. {
                errors[index] = variance.sqrt();
            } else {
                warn!(
                    "Dropping component {} of a {:?} measurement on surface {:?} with variance {}.",
                    index,
                    self.kind,
                    self.surface.id(),
                    variance
                );
            }
        }
        // Strips contribute a single rotated scalar.
        if self.kind.stereo().is_some() {
            errors[LOC2] = 0.;
        }
        errors
    }

    /// Measured value of component `index`.
    pub fn value(&self, index: usize) -> f64 {
        self.values[index]
    }

    /// Predicted scalar for component `index` from track parameters on the same surface.
    pub fn predicted(&self, index: usize, params: &Vector5<f64>) -> f64 {
        match self.kind.stereo() {
            Some((cos, sin)) if index == LOC1 => cos * params[LOC1] + sin * params[LOC2],
            _ => params[index],
        }
    }

    /// Variance of component `index` in key order lookup.
    pub fn variance(&self, index: usize) -> Option<f64> {
        let row = self.key.indices().position(|i| i == index)?;
        Some(self.covariance[(row, row)])
    }

    /// Global position of the measurement, unmeasured coordinates taken at the surface origin.
    pub fn position(&self) -> nalgebra::Vector3<f64> {
        let loc1 = if self.key.contains(LOC1) { self.values[LOC1] } else { 0. };
        let loc2 = if self.key.contains(LOC2) { self.values[LOC2] } else { 0. };
        match self.kind.stereo() {
            Some(_) => self.surface.measurement_position(0., 0.),
            None => self.surface.measurement_position(loc1, loc2),
        }
    }
}

/// Recalibrates raw hits with trial track parameters ("ROT creator").
pub trait MeasurementCorrector {
    /// Return a calibrated measurement for `raw` on `surface`, or `None` if the hit cannot be
    /// calibrated with these parameters.
    fn correct(
        &self,
        measurement: &Measurement,
        raw: &RawHit,
        params: &TrackParameters,
    ) -> Option<Measurement>;
}

/// Drift-circle corrector that only changes the error and resolves the left/right ambiguity
/// from the track.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DriftCircleCorrector {
    /// Error assigned to the recalibrated hit; `None` keeps the raw error.
    pub error: Option<f64>,
    /// Use the tube centre (radius zero) instead of the drift radius.
    pub tube_hit: bool,
}

impl DriftCircleCorrector {
    /// Precise calibration with the raw drift radius and error.
    pub fn precise() -> Self {
        Self {
            error: None,
            tube_hit: false,
        }
    }

    /// Broad calibration: tube centre with a flat error over the tube.
    pub fn broad(tube_radius: f64) -> Self {
        Self {
            error: Some(2. * tube_radius / 12f64.sqrt()),
            tube_hit: true,
        }
    }
}

impl MeasurementCorrector for DriftCircleCorrector {
    fn correct(
        &self,
        measurement: &Measurement,
        raw: &RawHit,
        params: &TrackParameters,
    ) -> Option<Measurement> {
        let MeasurementKind::DriftCircle { .. } = measurement.kind() else {
            return None;
        };
        let sign = if params.values()[LOC1] < 0. { -1. } else { 1. };
        let radius = if self.tube_hit { 0. } else { sign * raw.position };
        let error = self.error.unwrap_or(raw.error);
        Some(
            Measurement::drift_circle(measurement.surface().clone(), radius, error)
                .with_raw(raw.clone()),
        )
    }
}
