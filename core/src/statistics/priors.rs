use crate::physics::halo::DarkMatterPoint;
use crate::prelude::{ConfigError, ConfigResult, ParameterKind, ParameterVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};

/// Prior on a single fitted parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "prior", rename_all = "snake_case")]
pub enum Prior {
    Flat { low: f64, high: f64 },
    /// Normal distribution truncated to `[low, high]`.
    Gauss {
        mean: f64,
        std: f64,
        low: f64,
        high: f64,
    },
}

impl Prior {
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            Prior::Flat { low, high } | Prior::Gauss { low, high, .. } => (low, high),
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        let (low, high) = self.bounds();
        value.is_finite() && value >= low && value <= high
    }

    fn validate(&self, kind: ParameterKind) -> ConfigResult<()> {
        let fail = |message: String| {
            Err(ConfigError::MalformedPrior {
                parameter: kind,
                message,
            })
        };
        let (low, high) = self.bounds();
        if !(low.is_finite() && high.is_finite() && low < high) {
            return fail(format!("range [{}, {}] is empty or unbounded", low, high));
        }
        if let Prior::Gauss { mean, std, .. } = *self {
            if !(std.is_finite() && std > 0.0 && mean.is_finite()) {
                return fail(format!("gaussian needs finite mean and positive std, got {} +/- {}", mean, std));
            }
            let (a, b) = self.truncation();
            if !(b - a > 0.0) {
                return fail("truncation range carries no probability".into());
            }
        }
        Ok(())
    }

    fn normal(&self) -> Option<Normal> {
        match *self {
            Prior::Gauss { mean, std, .. } => Normal::new(mean, std).ok(),
            Prior::Flat { .. } => None,
        }
    }

    /// CDF of the untruncated normal at the two bounds.
    fn truncation(&self) -> (f64, f64) {
        let (low, high) = self.bounds();
        match self.normal() {
            Some(normal) => (normal.cdf(low), normal.cdf(high)),
            None => (0.0, 1.0),
        }
    }

    /// Map a unit-interval coordinate to a parameter value.
    pub fn transform(&self, unit: f64) -> f64 {
        let (low, high) = self.bounds();
        let unit = unit.clamp(0.0, 1.0);
        match self.normal() {
            None => low + unit * (high - low),
            Some(normal) => {
                let (a, b) = self.truncation();
                normal.inverse_cdf(a + unit * (b - a)).clamp(low, high)
            }
        }
    }

    /// Inverse of [`Prior::transform`].
    pub fn inverse(&self, value: f64) -> f64 {
        let (low, high) = self.bounds();
        match self.normal() {
            None => ((value - low) / (high - low)).clamp(0.0, 1.0),
            Some(normal) => {
                let (a, b) = self.truncation();
                ((normal.cdf(value) - a) / (b - a)).clamp(0.0, 1.0)
            }
        }
    }

    /// Normalized log-density; `-inf` outside the range.
    pub fn log_density(&self, value: f64) -> f64 {
        if !self.contains(value) {
            return f64::NEG_INFINITY;
        }
        let (low, high) = self.bounds();
        match self.normal() {
            None => -(high - low).ln(),
            Some(normal) => {
                let (a, b) = self.truncation();
                normal.ln_pdf(value) - (b - a).ln()
            }
        }
    }

    /// Centre of the prior mass, used when no starting value is given.
    pub fn center(&self) -> f64 {
        match *self {
            Prior::Flat { low, high } => 0.5 * (low + high),
            Prior::Gauss { mean, low, high, .. } => mean.clamp(low, high),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FittedParameter {
    pub parameter: ParameterKind,
    #[serde(flatten)]
    pub prior: Prior,
    /// Reference value for walker initialisation.
    #[serde(default)]
    pub start: Option<f64>,
}

impl FittedParameter {
    pub fn reference(&self) -> f64 {
        self.start.unwrap_or_else(|| self.prior.center())
    }
}

/// Ordered set of fitted parameters and their priors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    parameters: Vec<FittedParameter>,
}

impl ParameterSpace {
    pub fn new(parameters: Vec<FittedParameter>) -> ConfigResult<Self> {
        let space = Self { parameters };
        space.validate()?;
        Ok(space)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.parameters.is_empty() {
            return Err(ConfigError::InvalidSetting("no parameters to fit".into()));
        }
        for (i, fitted) in self.parameters.iter().enumerate() {
            if self.parameters[..i]
                .iter()
                .any(|other| other.parameter == fitted.parameter)
            {
                return Err(ConfigError::MalformedPrior {
                    parameter: fitted.parameter,
                    message: "declared twice".into(),
                });
            }
            fitted.prior.validate(fitted.parameter)?;
        }
        Ok(())
    }

    /// Priors from Pato et al. (2010) for the halo, with mass and
    /// cross-section ranges centred on `benchmark`.
    pub fn pato_2010(benchmark: &DarkMatterPoint, kinds: &[ParameterKind]) -> ConfigResult<Self> {
        let log_mass = benchmark.mass_gev.log10();
        let log_cross_section = benchmark.cross_section_cm2.log10();
        let parameters = kinds
            .iter()
            .map(|&kind| {
                let (prior, start) = match kind {
                    ParameterKind::LogMass => (
                        Prior::Flat {
                            low: log_mass - 2.5,
                            high: log_mass + 3.5,
                        },
                        log_mass,
                    ),
                    ParameterKind::LogCrossSection => (
                        Prior::Flat {
                            low: log_cross_section - 7.0,
                            high: log_cross_section + 5.0,
                        },
                        log_cross_section,
                    ),
                    ParameterKind::Density => (
                        Prior::Gauss {
                            mean: 0.4,
                            std: 0.1,
                            low: 0.001,
                            high: 0.9,
                        },
                        benchmark.halo.density,
                    ),
                    ParameterKind::V0 => (
                        Prior::Gauss {
                            mean: 230.0,
                            std: 30.0,
                            low: 80.0,
                            high: 380.0,
                        },
                        benchmark.halo.velocity.v_0,
                    ),
                    ParameterKind::VEsc => (
                        Prior::Gauss {
                            mean: 544.0,
                            std: 33.0,
                            low: 379.0,
                            high: 709.0,
                        },
                        benchmark.halo.velocity.v_esc,
                    ),
                };
                FittedParameter {
                    parameter: kind,
                    prior,
                    start: Some(start),
                }
            })
            .collect();
        Self::new(parameters)
    }

    pub fn dim(&self) -> usize {
        self.parameters.len()
    }

    pub fn parameters(&self) -> &[FittedParameter] {
        &self.parameters
    }

    pub fn kinds(&self) -> Vec<ParameterKind> {
        self.parameters.iter().map(|p| p.parameter).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.parameters
            .iter()
            .map(|p| p.parameter.name().to_string())
            .collect()
    }

    pub fn prior(&self, kind: ParameterKind) -> Option<&Prior> {
        self.parameters
            .iter()
            .find(|p| p.parameter == kind)
            .map(|p| &p.prior)
    }

    /// Unit hypercube to parameter space.
    pub fn transform(&self, unit: &[f64]) -> ParameterVector {
        ParameterVector::new(
            self.parameters
                .iter()
                .zip(unit)
                .map(|(p, &u)| (p.parameter, p.prior.transform(u)))
                .collect(),
        )
    }

    pub fn inverse(&self, point: &ParameterVector) -> Vec<f64> {
        self.parameters
            .iter()
            .map(|p| {
                point
                    .get(p.parameter)
                    .map(|value| p.prior.inverse(value))
                    .unwrap_or(0.5)
            })
            .collect()
    }

    pub fn vector(&self, values: &[f64]) -> ParameterVector {
        ParameterVector::from_values(&self.kinds(), values)
    }

    pub fn contains(&self, point: &ParameterVector) -> bool {
        self.parameters.iter().all(|p| {
            point
                .get(p.parameter)
                .map_or(false, |value| p.prior.contains(value))
        })
    }

    pub fn log_prior(&self, point: &ParameterVector) -> f64 {
        self.parameters
            .iter()
            .map(|p| match point.get(p.parameter) {
                Some(value) => p.prior.log_density(value),
                None => f64::NEG_INFINITY,
            })
            .sum()
    }
}
