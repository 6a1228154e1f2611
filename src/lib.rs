#![warn(missing_docs)]

//! Global chi-square fitter for charged-particle trajectories in a tracking detector. \
//! A track is described by its perigee parameters at a reference point plus one nuisance
//! parameter pair per scattering layer and one momentum kick per brem point. All of them are
//! fitted simultaneously by Gauss–Newton iteration on the normal equations, with optional
//! outlier removal, drift-circle recalibration and a hole search on the result.
//!
//! ## Interface
//! The central struct of this library is [`Fitter`]. It is created from a [`Propagator`]
//! (usually a [`HelixPropagator`]) and configured via `Fitter::with_*()` functions.
//!
//! Example:
//! ```rust,ignore
//! let fitter = Fitter::new(HelixPropagator::solenoid(2.))
//!     .with_geometry(&geometry)
//!     .with_prefit(true);
//! let track = fitter.fit(&measurements, &seed, true, ParticleHypothesis::Pion)?;
//! ```
//!
//! After constructing the fitter, there are four entry points:
//! - [`Fitter::fit()`]: fit a set of measurements from a seed.
//! - [`Fitter::refit()`]: fit a [`Track`] again, reusing its material.
//! - [`Fitter::extend()`]: fit a track together with additional measurements.
//! - [`Fitter::fit_combined()`]: fit two tracks as one.
//!
//! Independent fits can also be executed in parallel with `Fitter::fit_par()`.
//!
//! ## Parameters
//! All thresholds live in [`FitterConfig`], which can be read from TOML. The most relevant:
//! - `chi2_change_tolerance`: Absolute chi-square change below which the fit has converged.
//! - `max_iterations`: Iteration cap. Reaching it is a [`FitError::NoConvergence`].
//! - `outlier_cut`: Pull above which a silicon hit is turned into an outlier.
//! - `chi2_per_dof_cut`: Reduced chi-square above which a track is rejected.
//! - `fixed_momentum`: Momentum assumed for material effects when the field is off.
//!     **Required for straight-line fits with material.**
//!
//! ## Units
//! Lengths are in mm, momenta and energies in MeV, q/p in 1/MeV and the field in Tesla.

pub mod config;
pub mod error;
pub mod fitter;
pub mod geometry;
pub mod holes;
pub mod material;
pub mod measurement;
pub mod navigation;
pub mod parameters;
pub mod propagator;
pub mod state;
pub mod track;
pub mod trajectory;

pub(crate) mod cleaning;
pub(crate) mod derivatives;
pub(crate) mod iteration;
pub(crate) mod ndarray_utils;
pub(crate) mod normal;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{ConfigError, FitterConfig};
pub use error::{FitError, FitStatistics, FitStatisticsSnapshot};
pub use fitter::{FitJob, Fitter};
pub use geometry::{DetectorCategory, Surface, SurfaceId};
pub use holes::{HoleCount, LayerStepper, SurfaceBoundsCheck};
pub use material::{MaterialEffect, ParticleHypothesis};
pub use measurement::Measurement;
pub use navigation::{MaterialLayers, TrackingGeometry};
pub use parameters::{FitQuality, TrackParameters};
pub use propagator::{HelixPropagator, PropDirection, Propagator};
pub use track::{FittedState, FittedStateKind, Track};
