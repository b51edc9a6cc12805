//! Posterior exploration on top of [`ParallelEvaluator`].
//!
//! Both samplers hand whole batches of proposals to the evaluator, so the
//! backend decides where the likelihood actually runs. Output is normalized
//! to [`ParameterVector`]s regardless of the algorithm.

pub mod ensemble;
pub mod nested;

pub use ensemble::{EnsembleConfig, EnsembleSampler};
pub use nested::{NestedConfig, NestedSampler};

use crate::math::matrix::MatrixHelper;
use crate::parallel::{EvaluatorError, ParallelEvaluator};
use crate::prelude::{ParameterKind, ParameterVector};
use crate::statistics::objective::Objective;
use crate::statistics::priors::ParameterSpace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SamplerError {
    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),
    #[error("invalid sampler configuration: {0}")]
    InvalidConfig(String),
    #[error("no starting position has a finite posterior")]
    NoValidStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub log_z: f64,
    pub log_z_err: f64,
}

/// `value +/- error` for a parameter fitted as a base-10 logarithm, mapped
/// back to linear units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearEstimate {
    pub value: f64,
    pub error: f64,
}

/// Marginal posterior summary of one fitted parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub parameter: ParameterKind,
    pub mean: f64,
    pub std: f64,
    /// Present for `log_mass` and `log_cross_section`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear: Option<LinearEstimate>,
}

impl ParameterSummary {
    fn new(parameter: ParameterKind, mean: f64, variance: f64) -> Self {
        let std = variance.max(0.0).sqrt();
        let linear = parameter.linear_name().map(|_| {
            let value = 10f64.powf(mean);
            LinearEstimate {
                value,
                error: value * std::f64::consts::LN_10 * std,
            }
        });
        Self {
            parameter,
            mean,
            std,
            linear,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerOutput {
    pub sampler: String,
    pub parameter_names: Vec<String>,
    pub samples: Vec<ParameterVector>,
    pub weights: Vec<f64>,
    pub log_likelihoods: Vec<f64>,
    pub evidence: Option<Evidence>,
    pub n_evaluations: usize,
    pub acceptance_fraction: Option<f64>,
    /// Weighted posterior mean, in `parameter_names` order.
    pub mean: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
    #[serde(default)]
    pub parameters: Vec<ParameterSummary>,
    /// Unweighted draws from the posterior, see [`SamplerOutput::resample_equal`].
    #[serde(default)]
    pub posterior: Vec<ParameterVector>,
}

impl SamplerOutput {
    pub(crate) fn summarize(
        sampler: &str,
        space: &ParameterSpace,
        positions: Vec<Vec<f64>>,
        weights: Vec<f64>,
        log_likelihoods: Vec<f64>,
        seed: u64,
    ) -> Self {
        let (mean, covariance) = MatrixHelper::weighted_mean_cov(&positions, &weights);
        let parameters = space
            .kinds()
            .iter()
            .zip(mean.iter())
            .enumerate()
            .map(|(i, (&kind, &m))| ParameterSummary::new(kind, m, covariance[[i, i]]))
            .collect();
        let covariance = covariance
            .outer_iter()
            .map(|row| row.to_vec())
            .collect();
        let mut output = Self {
            sampler: sampler.to_string(),
            parameter_names: space.names(),
            samples: positions.iter().map(|values| space.vector(values)).collect(),
            weights,
            log_likelihoods,
            evidence: None,
            n_evaluations: 0,
            acceptance_fraction: None,
            mean: mean.to_vec(),
            covariance,
            parameters,
            posterior: Vec::new(),
        };
        output.posterior = output.resample_equal(seed);
        output
    }

    /// Equal-weight posterior draws: each sample is kept with probability
    /// `weight / max(weight)`.
    pub fn resample_equal(&self, seed: u64) -> Vec<ParameterVector> {
        let max_weight = self.weights.iter().copied().fold(0.0, f64::max);
        if !(max_weight > 0.0 && max_weight.is_finite()) {
            return Vec::new();
        }
        let mut rng = StdRng::seed_from_u64(seed);
        self.samples
            .iter()
            .zip(&self.weights)
            .filter(|(_, &weight)| rng.gen::<f64>() < weight / max_weight)
            .map(|(sample, _)| sample.clone())
            .collect()
    }

    /// Sample with the largest log-likelihood.
    pub fn best_fit(&self) -> Option<(&ParameterVector, f64)> {
        self.samples
            .iter()
            .zip(&self.log_likelihoods)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(sample, &logl)| (sample, logl))
    }
}

/// Sampler choice and its pass-through settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sampler", rename_all = "snake_case")]
pub enum SamplerAdapter {
    NestedSampling(NestedConfig),
    EnsembleMcmc(EnsembleConfig),
}

impl SamplerAdapter {
    pub fn name(&self) -> &'static str {
        match self {
            SamplerAdapter::NestedSampling(_) => "nested_sampling",
            SamplerAdapter::EnsembleMcmc(_) => "ensemble_mcmc",
        }
    }

    pub fn run(
        &self,
        evaluator: &ParallelEvaluator,
        objective: &dyn Objective,
        space: &ParameterSpace,
    ) -> Result<SamplerOutput, SamplerError> {
        match self {
            SamplerAdapter::NestedSampling(config) => {
                NestedSampler::new(config.clone(), space)?.run(evaluator, objective)
            }
            SamplerAdapter::EnsembleMcmc(config) => {
                EnsembleSampler::new(config.clone(), space)?.run(evaluator, objective)
            }
        }
    }
}

impl Default for SamplerAdapter {
    fn default() -> Self {
        SamplerAdapter::NestedSampling(NestedConfig::default())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::prelude::{ObjectiveResult, ParameterKind, ParameterVector};
    use crate::statistics::objective::{Objective, WorkerContext};
    use crate::statistics::priors::{FittedParameter, ParameterSpace, Prior};

    /// Unit Gaussian likelihood in every fitted coordinate, normalized.
    pub struct UnitGaussian;

    impl Objective for UnitGaussian {
        fn evaluate(&self, _ctx: &mut WorkerContext, point: &ParameterVector) -> ObjectiveResult {
            let values = point.values();
            let norm = -0.5 * values.len() as f64 * (2.0 * std::f64::consts::PI).ln();
            ObjectiveResult::Valid(norm - 0.5 * values.iter().map(|x| x * x).sum::<f64>())
        }
    }

    /// Two flat priors on [-5, 5], starting at 1.
    pub fn square_space() -> ParameterSpace {
        let flat = |parameter| FittedParameter {
            parameter,
            prior: Prior::Flat { low: -5.0, high: 5.0 },
            start: Some(1.0),
        };
        ParameterSpace::new(vec![
            flat(ParameterKind::LogMass),
            flat(ParameterKind::LogCrossSection),
        ])
        .unwrap()
    }
}
