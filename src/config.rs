//! Fitter configuration.
//!
//! All empirical thresholds of the iteration, cleaning and hole search logic live here so they can
//! be tuned from a TOML file instead of being buried in the algorithms.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors while loading or storing a [`FitterConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    /// The TOML text is malformed or has wrongly typed keys.
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    /// The configuration could not be serialized.
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    /// A value is outside its allowed range.
    #[error("Invalid configuration value for `{key}`: {reason}")]
    InvalidValue {
        /// Offending key.
        key: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Cylinder used to bound the blind extrapolation of the hole search.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CylinderConfig {
    /// Radius in mm.
    pub radius: f64,
    /// Half length along z in mm.
    pub half_length: f64,
}

/// Tunable parameters of the [`Fitter`](crate::Fitter).
///
/// Omitted keys in a TOML file take the [`Default`] values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitterConfig {
    /// Hard cap on iterations; reaching `max_iterations - 1` is a convergence failure.
    pub max_iterations: usize,
    /// Lower bound on the iterations before convergence may be declared.
    pub min_iterations: usize,
    /// Convergence tolerance on the absolute chi-square change between iterations.
    pub chi2_change_tolerance: f64,
    /// Pull above which a precision hit is removed.
    pub outlier_cut: f64,
    /// Reduced chi-square above which a track is rejected. Also scales the cleaner thresholds.
    pub chi2_per_dof_cut: f64,
    /// Maximum number of outliers on an accepted track.
    pub max_outliers: usize,
    /// Scale applied to the drift-circle error when deciding on a recalibration.
    pub drift_scale_factor: f64,
    /// Predicted drift radius above `factor * tube radius` turns the hit into an outlier.
    pub drift_acceptance_factor: f64,
    /// Minimum fraction of precision drift hits; zero disables the check.
    pub min_precision_hit_fraction: f64,
    /// Weight inflation on scatterer phi diagonals for iterations 0, 1, 2..=3, 4..=6 and later.
    pub phi_weights: [f64; 5],
    /// Momentum (MeV) assumed for material effects in straight-line fits.
    pub fixed_momentum: f64,
    /// Point defining the perigee surface the result is expressed on.
    pub reference_point: [f64; 3],
    /// Collect material from the tracking geometry.
    pub material_effects: bool,
    /// Fit energy loss as brem parameters for every material layer.
    pub fit_energy_loss: bool,
    /// Use asymmetric energy-loss errors and kink detection for electrons.
    pub asymmetric_energy_loss: bool,
    /// Reuse material states already carried by an input track.
    pub reuse_material: bool,
    /// Run a pre-fit pass with frozen energy-loss scatterers before the main fit.
    pub prefit: bool,
    /// Run the hole search on accepted tracks.
    pub hole_search: bool,
    /// Minimum number of measurements for the hole search.
    pub hole_search_min_measurements: usize,
    /// Minimum distance (mm) between consecutive states to look for holes in between.
    pub hole_search_min_separation: f64,
    /// Bounding volume for the blind extrapolation after the last measurement.
    pub hole_search_volume: CylinderConfig,
    /// Attach covariances and per-state fit qualities to the measurement states of the result.
    pub measurement_track_parameters: bool,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            min_iterations: 1,
            chi2_change_tolerance: 1.,
            outlier_cut: 5.,
            chi2_per_dof_cut: 7.,
            max_outliers: 10,
            drift_scale_factor: 2.5,
            drift_acceptance_factor: 1.05,
            min_precision_hit_fraction: 0.,
            phi_weights: [1.00000001, 1.0000001, 1.0001, 1.01, 1.1],
            fixed_momentum: 0.,
            reference_point: [0.; 3],
            material_effects: true,
            fit_energy_loss: false,
            asymmetric_energy_loss: true,
            reuse_material: true,
            prefit: false,
            hole_search: false,
            hole_search_min_measurements: 3,
            hole_search_min_separation: 2.5,
            hole_search_volume: CylinderConfig {
                radius: 560.,
                half_length: 2750.,
            },
            measurement_track_parameters: true,
        }
    }
}

impl FitterConfig {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Store the configuration as pretty TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Check value ranges that the algorithms rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations < 2 {
            return Err(ConfigError::InvalidValue {
                key: "max_iterations",
                reason: format!("must be at least 2, got {}", self.max_iterations),
            });
        }
        if !(self.chi2_change_tolerance > 0.) {
            return Err(ConfigError::InvalidValue {
                key: "chi2_change_tolerance",
                reason: "must be positive".into(),
            });
        }
        if self.phi_weights.iter().any(|w| *w < 1.) {
            return Err(ConfigError::InvalidValue {
                key: "phi_weights",
                reason: "weights must not deflate the diagonal".into(),
            });
        }
        if self.fixed_momentum < 0. {
            return Err(ConfigError::InvalidValue {
                key: "fixed_momentum",
                reason: "must not be negative".into(),
            });
        }
        Ok(())
    }

    /// Phi weight inflation for iteration `it`.
    pub(crate) fn phi_weight(&self, it: usize) -> f64 {
        match it {
            0 => self.phi_weights[0],
            1 => self.phi_weights[1],
            2..=3 => self.phi_weights[2],
            4..=6 => self.phi_weights[3],
            _ => self.phi_weights[4],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_keys_take_defaults() {
        let config = FitterConfig::from_toml_str(
            r#"
            max_iterations = 12
            outlier_cut = 4.0
            [hole_search_volume]
            radius = 100.0
            half_length = 200.0
            "#,
        )
        .unwrap();

        assert_eq!(config.max_iterations, 12);
        assert_eq!(config.outlier_cut, 4.);
        assert_eq!(config.hole_search_volume.radius, 100.);
        assert_eq!(config.max_outliers, FitterConfig::default().max_outliers);
        assert_eq!(config.phi_weights, FitterConfig::default().phi_weights);
    }

    #[test]
    fn round_trip_through_toml() {
        let mut config = FitterConfig::default();
        config.fit_energy_loss = true;
        config.reference_point = [1., 2., 3.];
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(FitterConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn rejects_deflating_weights() {
        let err = FitterConfig::from_toml_str("phi_weights = [1.0, 1.0, 0.5, 1.0, 1.0]").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "phi_weights", .. }));
    }

    #[test]
    fn phi_weight_schedule() {
        let config = FitterConfig::default();
        assert_eq!(config.phi_weight(0), 1.00000001);
        assert_eq!(config.phi_weight(3), 1.0001);
        assert_eq!(config.phi_weight(5), 1.01);
        assert_eq!(config.phi_weight(20), 1.1);
    }
}
