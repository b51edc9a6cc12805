use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical parameters the sampler may vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    /// log10 of the dark-matter mass in GeV/c^2.
    #[serde(rename = "log_mass")]
    LogMass,
    /// log10 of the spin-independent WIMP-nucleon cross-section in cm^2.
    #[serde(rename = "log_cross_section")]
    LogCrossSection,
    /// Most probable halo speed in km/s.
    #[serde(rename = "v_0")]
    V0,
    /// Galactic escape speed in km/s.
    #[serde(rename = "v_esc")]
    VEsc,
    /// Local dark-matter density in GeV/c^2/cm^3.
    #[serde(rename = "density")]
    Density,
}

impl ParameterKind {
    /// Canonical fit order.
    pub const ALL: [ParameterKind; 5] = [
        ParameterKind::LogMass,
        ParameterKind::LogCrossSection,
        ParameterKind::V0,
        ParameterKind::VEsc,
        ParameterKind::Density,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ParameterKind::LogMass => "log_mass",
            ParameterKind::LogCrossSection => "log_cross_section",
            ParameterKind::V0 => "v_0",
            ParameterKind::VEsc => "v_esc",
            ParameterKind::Density => "density",
        }
    }

    /// Name of the linear quantity behind a base-10 logarithmic parameter.
    pub fn linear_name(&self) -> Option<&'static str> {
        match self {
            ParameterKind::LogMass => Some("mass"),
            ParameterKind::LogCrossSection => Some("cross_section"),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// One sampler proposal: ordered (parameter, value) pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    entries: Vec<(ParameterKind, f64)>,
}

impl ParameterVector {
    pub fn new(entries: Vec<(ParameterKind, f64)>) -> Self {
        Self { entries }
    }

    pub fn from_values(kinds: &[ParameterKind], values: &[f64]) -> Self {
        Self {
            entries: kinds.iter().copied().zip(values.iter().copied()).collect(),
        }
    }

    pub fn get(&self, kind: ParameterKind) -> Option<f64> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, value)| *value)
    }

    pub fn kinds(&self) -> Vec<ParameterKind> {
        self.entries.iter().map(|(k, _)| *k).collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.entries.iter().map(|(_, v)| *v).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ParameterKind, f64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why an evaluation produced no usable log-likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidKind {
    PhysicallyInvalid,
    WorkerFailure,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidPoint {
    pub kind: InvalidKind,
    pub reason: String,
}

/// Scalar handed back to the sampler for one parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectiveResult {
    Valid(f64),
    Invalid(InvalidPoint),
}

impl ObjectiveResult {
    pub fn invalid(kind: InvalidKind, reason: impl Into<String>) -> Self {
        ObjectiveResult::Invalid(InvalidPoint {
            kind,
            reason: reason.into(),
        })
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ObjectiveResult::Valid(_))
    }

    /// Log-likelihood, or `sentinel` for invalid points.
    pub fn value_or(&self, sentinel: f64) -> f64 {
        match self {
            ObjectiveResult::Valid(value) => *value,
            ObjectiveResult::Invalid(_) => sentinel,
        }
    }
}

impl From<PhysicsError> for ObjectiveResult {
    fn from(err: PhysicsError) -> Self {
        ObjectiveResult::invalid(InvalidKind::PhysicallyInvalid, err.to_string())
    }
}

/// Per-point failures. These never abort a run.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PhysicsError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("{parameter} = {value} outside prior range [{low}, {high}]")]
    OutOfPrior {
        parameter: ParameterKind,
        value: f64,
        low: f64,
        high: f64,
    },
    #[error("shielding model failure: {0}")]
    Shielding(String),
    #[error("rate simulator failure: {0}")]
    Simulator(String),
    #[error("spectrum has {got} rates for a {expected}-point energy grid")]
    GridMismatch { expected: usize, got: usize },
}

pub type PhysicsResult<T> = Result<T, PhysicsError>;

/// Run-start failures. These are fatal before any evaluation begins.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("no experiments configured")]
    NoExperiments,
    #[error("unknown experiment preset: {0}")]
    UnknownPreset(String),
    #[error("unknown site: {0}")]
    UnknownSite(String),
    #[error("experiment {experiment}: {message}")]
    Experiment { experiment: String, message: String },
    #[error("malformed prior for {parameter}: {message}")]
    MalformedPrior {
        parameter: ParameterKind,
        message: String,
    },
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
