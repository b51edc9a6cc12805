use crate::math::integrate::IntegrationHelper;
use crate::prelude::{PhysicsError, PhysicsResult};
use serde::{Deserialize, Serialize};

/// Parameters that shape the dark-matter speed distribution, in km/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityParameters {
    pub v_0: f64,
    pub v_esc: f64,
    pub v_earth: f64,
}

impl Default for VelocityParameters {
    fn default() -> Self {
        Self {
            v_0: 230.0,
            v_esc: 544.0,
            v_earth: 232.0,
        }
    }
}

impl VelocityParameters {
    pub fn validate(&self) -> PhysicsResult<()> {
        for (label, value) in [("v_0", self.v_0), ("v_esc", self.v_esc), ("v_earth", self.v_earth)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(PhysicsError::InvalidParameter(format!(
                    "{} must be positive, got {}",
                    label, value
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HaloParameters {
    #[serde(flatten)]
    pub velocity: VelocityParameters,
    /// Local density in GeV/c^2/cm^3.
    pub density: f64,
}

impl Default for HaloParameters {
    fn default() -> Self {
        Self {
            velocity: VelocityParameters::default(),
            density: 0.3,
        }
    }
}

/// A fully resolved point in dark-matter parameter space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DarkMatterPoint {
    pub mass_gev: f64,
    pub cross_section_cm2: f64,
    pub halo: HaloParameters,
}

impl DarkMatterPoint {
    pub fn validate(&self) -> PhysicsResult<()> {
        if !(self.mass_gev.is_finite() && self.mass_gev > 0.0) {
            return Err(PhysicsError::InvalidParameter(format!(
                "mass must be positive, got {} GeV",
                self.mass_gev
            )));
        }
        if !(self.cross_section_cm2.is_finite() && self.cross_section_cm2 > 0.0) {
            return Err(PhysicsError::InvalidParameter(format!(
                "cross-section must be positive, got {} cm^2",
                self.cross_section_cm2
            )));
        }
        if !(self.halo.density.is_finite() && self.halo.density > 0.0) {
            return Err(PhysicsError::InvalidParameter(format!(
                "density must be positive, got {}",
                self.halo.density
            )));
        }
        self.halo.velocity.validate()
    }
}

/// Tabulated detector-frame speed distribution f(v), normalized to unit area.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityDistribution {
    speeds: Vec<f64>,
    pdf: Vec<f64>,
    /// Integral of f(v)/v from each grid speed to the end of the table.
    inverse_speed_tail: Vec<f64>,
}

impl VelocityDistribution {
    pub fn new(speeds: Vec<f64>, pdf: Vec<f64>) -> PhysicsResult<Self> {
        if speeds.len() < 2 || speeds.len() != pdf.len() {
            return Err(PhysicsError::InvalidParameter(
                "velocity table needs at least two matching points".into(),
            ));
        }
        if speeds.windows(2).any(|w| w[1] <= w[0]) || speeds[0] < 0.0 {
            return Err(PhysicsError::InvalidParameter(
                "velocity grid must be non-negative and increasing".into(),
            ));
        }
        if pdf.iter().any(|p| !(p.is_finite() && *p >= 0.0)) {
            return Err(PhysicsError::InvalidParameter(
                "velocity pdf must be finite and non-negative".into(),
            ));
        }
        let norm = IntegrationHelper::trapezoid(&speeds, &pdf);
        if !(norm > 0.0) {
            return Err(PhysicsError::InvalidParameter(
                "velocity pdf integrates to zero".into(),
            ));
        }
        let pdf: Vec<f64> = pdf.into_iter().map(|p| p / norm).collect();

        // f(0)/0 is finite for any physical halo, since f vanishes at least linearly.
        let over_v: Vec<f64> = speeds
            .iter()
            .zip(&pdf)
            .map(|(&v, &f)| if v > 0.0 { f / v } else { 0.0 })
            .collect();
        let inverse_speed_tail = IntegrationHelper::cumulative_tail(&speeds, &over_v);

        Ok(Self {
            speeds,
            pdf,
            inverse_speed_tail,
        })
    }

    pub fn speeds(&self) -> &[f64] {
        &self.speeds
    }

    pub fn pdf(&self) -> &[f64] {
        &self.pdf
    }

    /// Largest speed with non-zero probability density, in km/s.
    pub fn max_speed(&self) -> f64 {
        self.speeds
            .iter()
            .zip(&self.pdf)
            .rev()
            .find(|(_, &f)| f > 0.0)
            .map(|(&v, _)| v)
            .unwrap_or(0.0)
    }

    /// Mean inverse speed above `v_min` (km/s), in s/km.
    pub fn mean_inverse_speed(&self, v_min: f64) -> f64 {
        if v_min <= self.speeds[0] {
            return self.inverse_speed_tail[0];
        }
        IntegrationHelper::interpolate(&self.speeds, &self.inverse_speed_tail, v_min)
    }

    /// Copy of this distribution with every speed multiplied by `factor`,
    /// keeping the total probability.
    pub fn rescaled(&self, factor: f64) -> PhysicsResult<Self> {
        if !(factor.is_finite() && factor > 0.0) {
            return Err(PhysicsError::Shielding(format!(
                "speed scale factor must be positive, got {}",
                factor
            )));
        }
        Self::new(
            self.speeds.iter().map(|v| v * factor).collect(),
            self.pdf.iter().map(|f| f / factor).collect(),
        )
    }
}

/// Truncated Maxwellian halo boosted into the Earth frame.
pub struct StandardHalo;

impl StandardHalo {
    pub const DEFAULT_GRID_POINTS: usize = 1000;

    pub fn distribution(
        velocity: &VelocityParameters,
        grid_points: usize,
    ) -> PhysicsResult<VelocityDistribution> {
        velocity.validate()?;
        let VelocityParameters { v_0, v_esc, v_earth } = *velocity;
        let v_max = v_esc + v_earth;
        let n = grid_points.max(2);
        let step = v_max / (n - 1) as f64;
        let cutoff = (-(v_esc * v_esc) / (v_0 * v_0)).exp();

        let speeds: Vec<f64> = (0..n).map(|i| i as f64 * step).collect();
        let pdf = speeds
            .iter()
            .map(|&v| {
                let boosted = (-(v - v_earth).powi(2) / (v_0 * v_0)).exp();
                let g = if v <= v_esc - v_earth {
                    boosted - (-(v + v_earth).powi(2) / (v_0 * v_0)).exp()
                } else {
                    boosted - cutoff
                };
                (v / v_earth * g).max(0.0)
            })
            .collect();

        VelocityDistribution::new(speeds, pdf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn standard_halo_is_normalized_and_bounded() {
        let velocity = VelocityParameters::default();
        let dist = StandardHalo::distribution(&velocity, 500).unwrap();
        assert_relative_eq!(
            IntegrationHelper::trapezoid(dist.speeds(), dist.pdf()),
            1.0,
            epsilon = 1e-9
        );
        assert!(dist.max_speed() <= velocity.v_esc + velocity.v_earth);
    }

    #[test]
    fn mean_inverse_speed_decreases_with_threshold() {
        let dist = StandardHalo::distribution(&VelocityParameters::default(), 500).unwrap();
        let low = dist.mean_inverse_speed(0.0);
        let mid = dist.mean_inverse_speed(300.0);
        let high = dist.mean_inverse_speed(900.0);
        assert!(low > mid && mid > 0.0);
        assert_eq!(high, 0.0);
    }

    #[test]
    fn rescaled_keeps_probability() {
        let dist = StandardHalo::distribution(&VelocityParameters::default(), 200).unwrap();
        let slowed = dist.rescaled(0.5).unwrap();
        assert_relative_eq!(slowed.max_speed(), dist.max_speed() * 0.5, epsilon = 1e-9);
        assert_relative_eq!(
            IntegrationHelper::trapezoid(slowed.speeds(), slowed.pdf()),
            1.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn invalid_velocity_parameters_are_rejected() {
        let velocity = VelocityParameters {
            v_0: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            StandardHalo::distribution(&velocity, 100),
            Err(PhysicsError::InvalidParameter(_))
        ));
    }
}
