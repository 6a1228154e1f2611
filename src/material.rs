//! Material interactions: properties, physics models and the per-node [`MaterialEffect`].

use crate::error::FitError;
use crate::geometry::correct_angles;
use crate::navigation::LayerId;
use crate::parameters::{PHI, QOP_SCALE, QOVERP, THETA, TrackParameters};

/// Electron mass in MeV.
pub const ELECTRON_MASS: f64 = 0.51099895;
/// Masses above this value (MeV) use the heavy-particle energy-loss error switching.
pub(crate) const HEAVY_MASS_THRESHOLD: f64 = 100.;

/// Particle hypothesis of a fit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ParticleHypothesis {
    /// No material interactions at all.
    NonInteracting,
    /// Electron; radiative losses and brem kinks.
    Electron,
    /// Muon.
    Muon,
    /// Charged pion (the default hypothesis).
    #[default]
    Pion,
    /// Charged kaon.
    Kaon,
    /// Proton.
    Proton,
}

impl ParticleHypothesis {
    /// Rest mass in MeV.
    pub fn mass(self) -> f64 {
        match self {
            Self::NonInteracting => 0.,
            Self::Electron => ELECTRON_MASS,
            Self::Muon => 105.6583755,
            Self::Pion => 139.57039,
            Self::Kaon => 493.677,
            Self::Proton => 938.27208816,
        }
    }
}

/// Bulk properties of a material slab.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaterialProperties {
    /// Thickness in mm.
    pub thickness: f64,
    /// Radiation length in mm.
    pub x0: f64,
    /// Nuclear interaction length in mm.
    pub l0: f64,
    /// Atomic mass.
    pub a: f64,
    /// Atomic number.
    pub z: f64,
    /// Density in g/cm³.
    pub rho: f64,
}

impl MaterialProperties {
    /// Silicon slab of the given thickness.
    pub fn silicon(thickness: f64) -> Self {
        Self {
            thickness,
            x0: 93.7,
            l0: 465.2,
            a: 28.0855,
            z: 14.,
            rho: 2.329,
        }
    }

    /// Thickness in radiation lengths at normal incidence.
    pub fn thickness_in_x0(&self) -> f64 {
        self.thickness / self.x0
    }
}

/// Scattering angle width of a material crossing.
pub trait ScatteringModel {
    /// Projected multiple-scattering angle σ (rad) after `x_over_x0` radiation lengths.
    fn sigma(&self, x_over_x0: f64, momentum: f64, mass: f64) -> f64;
}

/// Highland formula with the logarithmic correction.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HighlandScattering;

impl ScatteringModel for HighlandScattering {
    fn sigma(&self, x_over_x0: f64, momentum: f64, mass: f64) -> f64 {
        if x_over_x0 <= 0. || momentum <= 0. {
            return 0.;
        }
        let energy = (momentum * momentum + mass * mass).sqrt();
        let beta = momentum / energy;
        let log_term = 1. + 0.038 * (x_over_x0 / (beta * beta)).ln();
        (13.6 / (beta * momentum) * x_over_x0.sqrt() * log_term).max(0.)
    }
}

/// Mean energy loss and its (possibly asymmetric) spread.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EnergyLoss {
    /// Mean energy lost in MeV (positive).
    pub delta_e: f64,
    /// Symmetric spread.
    pub sigma: f64,
    /// Spread towards smaller losses.
    pub sigma_minus: f64,
    /// Spread towards larger losses.
    pub sigma_plus: f64,
}

/// Energy loss of a material crossing.
pub trait EnergyLossModel {
    /// Energy loss over `path` mm of `material` for momentum `momentum` (MeV).
    fn energy_loss(
        &self,
        material: &MaterialProperties,
        path: f64,
        momentum: f64,
        particle: ParticleHypothesis,
    ) -> EnergyLoss;
}

/// Bethe–Bloch ionisation with a Landau width; Bethe–Heitler radiation for electrons.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BetheEnergyLoss;

impl BetheEnergyLoss {
    const K: f64 = 0.307075;
    /// Landau full width ≈ 4ξ, converted to a Gaussian sigma.
    const LANDAU_TO_SIGMA: f64 = 4. / 2.3548;

    /// Mean ionisation loss per mm.
    pub fn dedx(material: &MaterialProperties, momentum: f64, mass: f64) -> f64 {
        if material.a <= 0. || material.z <= 0. || mass <= 0. {
            return 0.;
        }
        let energy = (momentum * momentum + mass * mass).sqrt();
        let beta = momentum / energy;
        let gamma = energy / mass;
        let beta_gamma_sq = (beta * gamma).powi(2);
        let mass_ratio = ELECTRON_MASS / mass;
        let t_max = 2. * ELECTRON_MASS * beta_gamma_sq
            / (1. + 2. * gamma * mass_ratio + mass_ratio * mass_ratio);
        let excitation = 16e-6 * material.z.powf(0.9);
        let log_term = 0.5
            * (2. * ELECTRON_MASS * beta_gamma_sq * t_max / (excitation * excitation)).ln()
            - beta * beta;
        // K is per cm for rho in g/cm³.
        0.1 * Self::K * material.z / material.a * material.rho / (beta * beta) * log_term.max(0.)
    }
}

impl EnergyLossModel for BetheEnergyLoss {
    fn energy_loss(
        &self,
        material: &MaterialProperties,
        path: f64,
        momentum: f64,
        particle: ParticleHypothesis,
    ) -> EnergyLoss {
        let mass = particle.mass();
        if particle == ParticleHypothesis::NonInteracting || momentum <= 0. {
            return EnergyLoss {
                delta_e: 0.,
                sigma: 0.,
                sigma_minus: 0.,
                sigma_plus: 0.,
            };
        }
        let energy = (momentum * momentum + mass * mass).sqrt();
        let beta = momentum / energy;
        let xi = 0.05 * Self::K * material.z / material.a * material.rho * path / (beta * beta);
        let sigma_ion = Self::LANDAU_TO_SIGMA * xi;
        let ionisation = Self::dedx(material, momentum, mass) * path;

        if particle != ParticleHypothesis::Electron {
            return EnergyLoss {
                delta_e: ionisation,
                sigma: sigma_ion,
                sigma_minus: sigma_ion,
                sigma_plus: sigma_ion,
            };
        }

        let t = path / material.x0;
        let radiation = energy * (1. - (-t).exp());
        let variance = energy
            * energy
            * ((-t * 3f64.ln() / 2f64.ln()).exp() - (-2. * t).exp()).max(0.);
        let sigma_plus = (sigma_ion * sigma_ion + variance).sqrt();
        EnergyLoss {
            delta_e: ionisation + radiation,
            sigma: sigma_plus,
            sigma_minus: sigma_ion,
            sigma_plus,
        }
    }
}

/// Parameters of one material node on a trajectory.
///
/// A node with `sigma_delta_theta != 0` is a scatterer (two angle nuisance parameters);
/// one with `sigma_delta_e > 0` is a brem point (one momentum nuisance parameter).
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MaterialEffect {
    /// Fitted azimuthal scattering angle.
    pub delta_phi: f64,
    /// Fitted polar scattering angle.
    pub delta_theta: f64,
    /// Prior width of `delta_phi`.
    pub sigma_delta_phi: f64,
    /// Prior width of `delta_theta`.
    pub sigma_delta_theta: f64,
    /// Prior mean of `delta_phi`.
    pub measured_delta_phi: f64,
    /// Energy loss in MeV (negative for a loss).
    pub delta_e: f64,
    /// Width of the energy loss; positive turns the node into a brem point.
    pub sigma_delta_e: f64,
    /// Width used for pulls towards larger losses.
    pub sigma_delta_e_pos: f64,
    /// Width used for pulls towards smaller losses.
    pub sigma_delta_e_neg: f64,
    /// Fitted change of q/p across the node, in units of 1e-3 q/p (1/GeV).
    pub delta_p: f64,
    /// Thickness in radiation lengths along the track.
    pub x0: f64,
    /// A kink (hard brem) was detected at this node.
    pub kink: bool,
    /// Layer the material was taken from.
    pub layer: Option<LayerId>,
}

impl MaterialEffect {
    /// Node of `x_over_x0` radiation lengths without any effect yet.
    pub fn new(x_over_x0: f64) -> Self {
        Self {
            x0: x_over_x0,
            ..Self::default()
        }
    }

    /// Set the scattering priors.
    pub fn with_scattering(mut self, sigma_delta_phi: f64, sigma_delta_theta: f64) -> Self {
        self.sigma_delta_phi = sigma_delta_phi;
        self.sigma_delta_theta = sigma_delta_theta;
        self
    }

    /// Set a deterministic energy loss.
    pub fn with_energy_loss(mut self, delta_e: f64) -> Self {
        self.delta_e = delta_e;
        self
    }

    /// Make the node a brem point with the given loss widths.
    pub fn with_fitted_energy_loss(mut self, sigma: f64, sigma_neg: f64, sigma_pos: f64) -> Self {
        self.sigma_delta_e = sigma;
        self.sigma_delta_e_neg = sigma_neg;
        self.sigma_delta_e_pos = sigma_pos;
        self
    }

    /// Tag the originating layer.
    pub fn with_layer(mut self, layer: LayerId) -> Self {
        self.layer = Some(layer);
        self
    }

    /// Whether the node carries fitted scattering angles. In pre-fit mode, nodes that also
    /// lose energy are frozen.
    pub fn is_scatterer(&self, prefit: bool) -> bool {
        self.sigma_delta_theta != 0. && (!prefit || self.delta_e == 0.)
    }

    /// Whether the node carries a fitted momentum kick.
    pub fn is_brem(&self) -> bool {
        self.sigma_delta_e > 0.
    }

    /// Initialize `delta_p` to the kick a deterministic loss would give at `params`.
    pub(crate) fn seed_delta_p(&mut self, params: &TrackParameters, mass: f64) {
        let qop = params.qoverp();
        if qop == 0. {
            return;
        }
        let p = 1. / qop.abs();
        let de = self.delta_e.abs();
        let newp2 = p * p - 2. * de * (mass * mass + p * p).sqrt() + de * de;
        if newp2 > 0. {
            let new_qop = qop.signum() / newp2.sqrt();
            self.delta_p = (new_qop - qop) / QOP_SCALE;
        }
    }

    /// Apply the node to `params` when crossing it. `sign` is +1 going downstream
    /// and −1 going upstream.
    pub(crate) fn apply(
        &self,
        params: &TrackParameters,
        sign: f64,
        mass: f64,
        straight: bool,
    ) -> Result<TrackParameters, FitError> {
        let mut values = *params.values();
        let phi = values[PHI] + sign * self.delta_phi;
        let theta = values[THETA] + sign * self.delta_theta;
        let (phi, theta) =
            correct_angles(phi, theta).ok_or(FitError::InvalidAngles { phi, theta })?;
        values[PHI] = phi;
        values[THETA] = theta;

        if !straight {
            if self.sigma_delta_e <= 0. {
                if self.delta_e != 0. && values[QOVERP] != 0. {
                    let qop = values[QOVERP];
                    let p = 1. / qop.abs();
                    let de = self.delta_e.abs();
                    let newp2 = p * p - sign * 2. * de * (mass * mass + p * p).sqrt() + de * de;
                    if newp2 <= 0. {
                        return Err(FitError::ExtrapolationFailureDueToSmallMomentum {
                            momentum_squared: newp2,
                        });
                    }
                    values[QOVERP] = qop.signum() / newp2.sqrt();
                }
            } else {
                values[QOVERP] += sign * QOP_SCALE * self.delta_p;
            }
        }
        Ok(params.with_values(values))
    }

    /// Ratio d(q/p out)/d(q/p in) for a deterministic loss crossed with `sign` at `qop`.
    pub(crate) fn qop_derivative(&self, qop: f64, sign: f64, mass: f64) -> f64 {
        if self.sigma_delta_e > 0. || self.delta_e == 0. || qop == 0. {
            return 1.;
        }
        let p = 1. / qop.abs();
        let de = self.delta_e.abs();
        let energy = (mass * mass + p * p).sqrt();
        let newp2 = p * p - sign * 2. * de * energy + de * de;
        if newp2 <= 0. {
            return 1.;
        }
        let newp = newp2.sqrt();
        // d(newp)/dp = (p - sign * de * p / E) / newp, and q/p scales as 1/p².
        let dnewp_dp = (p - sign * de * p / energy) / newp;
        dnewp_dp * (p * p) / (newp * newp)
    }
}
