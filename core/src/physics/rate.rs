use crate::experiment::{ExperimentConfig, Target};
use crate::physics::halo::{DarkMatterPoint, VelocityDistribution};
use crate::prelude::{PhysicsError, PhysicsResult};
use log::{debug, warn};
use std::sync::Arc;

const GEV_TO_KG: f64 = 1.782_661_92e-27;
const AMU_GEV: f64 = 0.931_494_102_42;
const NUCLEON_GEV: f64 = 0.938_272_088;
const KEV_TO_J: f64 = 1.602_176_634e-16;
const HBARC_GEV_FM: f64 = 0.197_326_980_4;
const SECONDS_PER_YEAR: f64 = 3.155_76e7;
const KG_PER_TONNE: f64 = 1.0e3;

/// Differential recoil rate on an energy grid, in events / keV / tonne / year.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSpectrum {
    pub energies_kev: Vec<f64>,
    pub rates: Vec<f64>,
}

impl RateSpectrum {
    pub fn zeros(energies_kev: Vec<f64>) -> Self {
        let rates = vec![0.0; energies_kev.len()];
        Self {
            energies_kev,
            rates,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.rates.iter().all(|r| *r == 0.0)
    }
}

/// Physics backend producing dR/dE for one point and target.
pub trait RateSimulator: Send + Sync {
    fn differential_rate(
        &self,
        point: &DarkMatterPoint,
        distribution: &VelocityDistribution,
        target: Target,
        energies_kev: &[f64],
    ) -> PhysicsResult<Vec<f64>>;
}

fn reduced_mass(a: f64, b: f64) -> f64 {
    a * b / (a + b)
}

/// Kinematic end point of the recoil spectrum, in keV.
pub fn max_recoil_energy_kev(mass_gev: f64, target: Target, v_max_km_s: f64) -> f64 {
    let m_target = target.mass_number() * AMU_GEV;
    let mu = reduced_mass(mass_gev, m_target) * GEV_TO_KG;
    let v = v_max_km_s * 1.0e3;
    2.0 * mu * mu * v * v / (m_target * GEV_TO_KG) / KEV_TO_J
}

/// Helm nuclear form factor.
pub fn helm_form_factor(energy_kev: f64, target: Target) -> f64 {
    let a = target.mass_number();
    let m_target = a * AMU_GEV;
    let q = (2.0 * m_target * energy_kev * 1.0e-6).sqrt() / HBARC_GEV_FM;
    let s = 0.9;
    let c = 1.23 * a.cbrt() - 0.6;
    let r_n = (c * c + 7.0 / 3.0 * std::f64::consts::PI.powi(2) * 0.52 * 0.52 - 5.0 * s * s).sqrt();
    let qr = q * r_n;
    if qr < 1e-6 {
        return 1.0;
    }
    3.0 * (qr.sin() - qr * qr.cos()) / qr.powi(3) * (-(q * s).powi(2) / 2.0).exp()
}

/// Spin-independent elastic WIMP-nucleus scattering.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardRate;

impl RateSimulator for StandardRate {
    fn differential_rate(
        &self,
        point: &DarkMatterPoint,
        distribution: &VelocityDistribution,
        target: Target,
        energies_kev: &[f64],
    ) -> PhysicsResult<Vec<f64>> {
        let a = target.mass_number();
        let m_target = a * AMU_GEV * GEV_TO_KG;
        let m_chi = point.mass_gev * GEV_TO_KG;
        let mu_target = reduced_mass(m_chi, m_target);
        let mu_nucleon = reduced_mass(point.mass_gev, NUCLEON_GEV) * GEV_TO_KG;
        let rho = point.halo.density * GEV_TO_KG * 1.0e6;
        let sigma = point.cross_section_cm2 * 1.0e-4;
        let prefactor = rho * sigma * a * a / (2.0 * m_chi * mu_nucleon * mu_nucleon);
        let to_detector_units = KEV_TO_J * KG_PER_TONNE * SECONDS_PER_YEAR;

        energies_kev
            .iter()
            .map(|&e| {
                if e <= 0.0 {
                    return Ok(0.0);
                }
                let e_joule = e * KEV_TO_J;
                let v_min = (m_target * e_joule / (2.0 * mu_target * mu_target)).sqrt() / 1.0e3;
                let eta = distribution.mean_inverse_speed(v_min) * 1.0e-3;
                let form = helm_form_factor(e, target);
                Ok(prefactor * form * form * eta * to_detector_units)
            })
            .collect()
    }
}

/// Validating wrapper around a [`RateSimulator`].
#[derive(Clone)]
pub struct RateModel {
    simulator: Arc<dyn RateSimulator>,
}

impl RateModel {
    pub fn new(simulator: Arc<dyn RateSimulator>) -> Self {
        Self { simulator }
    }

    pub fn standard() -> Self {
        Self::new(Arc::new(StandardRate))
    }

    /// Differential rate on the experiment's fine energy grid.
    ///
    /// Invalid parameters are errors. A signal that cannot reach the threshold,
    /// and any simulator failure, yield an all-zero spectrum.
    pub fn spectrum(
        &self,
        point: &DarkMatterPoint,
        distribution: &VelocityDistribution,
        experiment: &ExperimentConfig,
    ) -> PhysicsResult<RateSpectrum> {
        point.validate()?;
        let energies = experiment.fine_energies();

        let e_max = max_recoil_energy_kev(point.mass_gev, experiment.target, distribution.max_speed());
        if e_max < experiment.threshold_kev {
            debug!(
                "{}: max recoil {:.4} keV below threshold {} keV for m={} GeV",
                experiment.name, e_max, experiment.threshold_kev, point.mass_gev
            );
            return Ok(RateSpectrum::zeros(energies));
        }

        match self
            .simulator
            .differential_rate(point, distribution, experiment.target, &energies)
        {
            Ok(rates) if rates.len() == energies.len() && rates.iter().all(|r| r.is_finite()) => {
                let rates = rates.into_iter().map(|r| r.max(0.0)).collect();
                Ok(RateSpectrum {
                    energies_kev: energies,
                    rates,
                })
            }
            Ok(_) => {
                warn!("{}: simulator returned a malformed rate table", experiment.name);
                Ok(RateSpectrum::zeros(energies))
            }
            Err(err @ PhysicsError::InvalidParameter(_)) => Err(err),
            Err(err) => {
                warn!("{}: {}; using zero rate", experiment.name, err);
                Ok(RateSpectrum::zeros(energies))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::preset;
    use crate::physics::halo::{HaloParameters, StandardHalo, VelocityParameters};

    fn benchmark(mass_gev: f64) -> DarkMatterPoint {
        DarkMatterPoint {
            mass_gev,
            cross_section_cm2: 1e-45,
            halo: HaloParameters::default(),
        }
    }

    fn halo() -> VelocityDistribution {
        StandardHalo::distribution(&VelocityParameters::default(), 500).unwrap()
    }

    struct BrokenSimulator;

    impl RateSimulator for BrokenSimulator {
        fn differential_rate(
            &self,
            _point: &DarkMatterPoint,
            _distribution: &VelocityDistribution,
            _target: Target,
            _energies_kev: &[f64],
        ) -> PhysicsResult<Vec<f64>> {
            Err(PhysicsError::Simulator("table lookup failed".into()))
        }
    }

    struct ShortSimulator;

    impl RateSimulator for ShortSimulator {
        fn differential_rate(
            &self,
            _point: &DarkMatterPoint,
            _distribution: &VelocityDistribution,
            _target: Target,
            energies_kev: &[f64],
        ) -> PhysicsResult<Vec<f64>> {
            Ok(vec![1.0; energies_kev.len() / 2])
        }
    }

    #[test]
    fn spectrum_is_pure() {
        let model = RateModel::standard();
        let xe = preset("Xe").unwrap();
        let dist = halo();
        let first = model.spectrum(&benchmark(50.0), &dist, &xe).unwrap();
        let second = model.spectrum(&benchmark(50.0), &dist, &xe).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_zero());
    }

    #[test]
    fn light_mass_below_threshold_gives_zero_rate() {
        let xe = preset("Xe").unwrap();
        let dist = halo();
        assert!(max_recoil_energy_kev(1.0, Target::Xe, dist.max_speed()) < xe.threshold_kev);
        let spectrum = RateModel::standard().spectrum(&benchmark(1.0), &dist, &xe).unwrap();
        assert!(spectrum.is_zero());
        assert_eq!(spectrum.energies_kev.len(), 100);
    }

    #[test]
    fn nonpositive_parameters_are_invalid() {
        let xe = preset("Xe").unwrap();
        let mut point = benchmark(50.0);
        point.cross_section_cm2 = 0.0;
        assert!(matches!(
            RateModel::standard().spectrum(&point, &halo(), &xe),
            Err(PhysicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn simulator_failure_becomes_zero_rate() {
        let model = RateModel::new(Arc::new(BrokenSimulator));
        let spectrum = model
            .spectrum(&benchmark(50.0), &halo(), &preset("Xe").unwrap())
            .unwrap();
        assert!(spectrum.is_zero());
    }

    #[test]
    fn malformed_rate_table_becomes_zero_rate() {
        let model = RateModel::new(Arc::new(ShortSimulator));
        let spectrum = model
            .spectrum(&benchmark(50.0), &halo(), &preset("Xe").unwrap())
            .unwrap();
        assert!(spectrum.is_zero());
        assert_eq!(spectrum.energies_kev.len(), spectrum.rates.len());
    }

    #[test]
    fn helm_form_factor_is_one_at_zero_momentum() {
        assert_eq!(helm_form_factor(0.0, Target::Xe), 1.0);
        assert!(helm_form_factor(50.0, Target::Xe) < 1.0);
    }
}
