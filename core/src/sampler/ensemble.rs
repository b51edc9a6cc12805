use crate::parallel::ParallelEvaluator;
use crate::prelude::ObjectiveResult;
use crate::sampler::{SamplerError, SamplerOutput};
use crate::statistics::objective::Objective;
use crate::statistics::priors::ParameterSpace;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub nwalkers: usize,
    pub nsteps: usize,
    /// Leading share of steps discarded as burn-in.
    pub burn_fraction: f64,
    pub thin: usize,
    /// Relative spread of the initial walkers around the reference point.
    pub start_jitter: f64,
    /// Stretch-move scale `a`.
    pub stretch_scale: f64,
    pub seed: u64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            nwalkers: 50,
            nsteps: 100,
            burn_fraction: 0.2,
            thin: 15,
            start_jitter: 0.005,
            stretch_scale: 2.0,
            seed: 0,
        }
    }
}

#[derive(Clone)]
struct Walker {
    position: Vec<f64>,
    log_prob: f64,
    log_likelihood: f64,
}

/// Affine-invariant ensemble sampler (Goodman & Weare stretch move).
///
/// The ensemble is split in two halves; each half is moved against the other
/// and its proposals are evaluated as one batch.
pub struct EnsembleSampler<'a> {
    config: EnsembleConfig,
    space: &'a ParameterSpace,
}

impl<'a> EnsembleSampler<'a> {
    pub fn new(config: EnsembleConfig, space: &'a ParameterSpace) -> Result<Self, SamplerError> {
        let dim = space.dim();
        if config.nwalkers % 2 != 0 || config.nwalkers < 2 * dim {
            return Err(SamplerError::InvalidConfig(format!(
                "nwalkers must be even and at least {}, got {}",
                2 * dim,
                config.nwalkers
            )));
        }
        if !(0.0..1.0).contains(&config.burn_fraction) {
            return Err(SamplerError::InvalidConfig(format!(
                "burn_fraction must be in [0, 1), got {}",
                config.burn_fraction
            )));
        }
        if !(config.stretch_scale > 1.0) {
            return Err(SamplerError::InvalidConfig(format!(
                "stretch_scale must exceed 1, got {}",
                config.stretch_scale
            )));
        }
        Ok(Self { config, space })
    }

    /// Log-posterior for each position. Points outside the prior are never
    /// sent to the evaluator.
    fn log_posterior(
        &self,
        evaluator: &ParallelEvaluator,
        objective: &dyn Objective,
        positions: &[Vec<f64>],
        n_evaluations: &mut usize,
    ) -> Result<Vec<(f64, f64)>, SamplerError> {
        let vectors: Vec<_> = positions.iter().map(|p| self.space.vector(p)).collect();
        let priors: Vec<f64> = vectors.iter().map(|v| self.space.log_prior(v)).collect();
        let inside: Vec<usize> = (0..vectors.len()).filter(|&i| priors[i].is_finite()).collect();
        let batch: Vec<_> = inside.iter().map(|&i| vectors[i].clone()).collect();
        let results = evaluator.map(objective, &batch)?;
        *n_evaluations += batch.len();

        let mut out = vec![(f64::NEG_INFINITY, f64::NEG_INFINITY); positions.len()];
        for (&i, result) in inside.iter().zip(results) {
            if let ObjectiveResult::Valid(log_likelihood) = result {
                out[i] = (priors[i] + log_likelihood, log_likelihood);
            }
        }
        Ok(out)
    }

    fn initial_positions(&self, rng: &mut StdRng) -> Vec<Vec<f64>> {
        (0..self.config.nwalkers)
            .map(|_| {
                self.space
                    .parameters()
                    .iter()
                    .map(|p| {
                        let reference = p.reference();
                        let scale = if reference == 0.0 { 1.0 } else { reference.abs() };
                        let noise: f64 = rng.sample(StandardNormal);
                        let (low, high) = p.prior.bounds();
                        (reference + self.config.start_jitter * scale * noise).clamp(low, high)
                    })
                    .collect()
            })
            .collect()
    }

    pub fn run(&self, evaluator: &ParallelEvaluator, objective: &dyn Objective) -> Result<SamplerOutput, SamplerError> {
        let dim = self.space.dim();
        let nwalkers = self.config.nwalkers;
        let half = nwalkers / 2;
        let a = self.config.stretch_scale;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut n_evaluations = 0;

        let start = self.initial_positions(&mut rng);
        let start_values = self.log_posterior(evaluator, objective, &start, &mut n_evaluations)?;
        let mut walkers: Vec<Walker> = start
            .into_iter()
            .zip(start_values)
            .map(|(position, (log_prob, log_likelihood))| Walker {
                position,
                log_prob,
                log_likelihood,
            })
            .collect();
        let stuck = walkers.iter().filter(|w| !w.log_prob.is_finite()).count();
        if stuck == nwalkers {
            return Err(SamplerError::NoValidStart);
        }
        if stuck > 0 {
            warn!("{} of {} walkers start with zero posterior", stuck, nwalkers);
        }

        info!(
            "ensemble sampling: {} walkers x {} steps in {} dimensions",
            nwalkers, self.config.nsteps, dim
        );

        let mut chain: Vec<Vec<Walker>> = Vec::with_capacity(self.config.nsteps);
        let mut accepted = 0usize;
        for _ in 0..self.config.nsteps {
            for (active, other) in [(0..half, half..nwalkers), (half..nwalkers, 0..half)] {
                let mut proposals = Vec::with_capacity(half);
                let mut stretches = Vec::with_capacity(half);
                for k in active.clone() {
                    let z = ((a - 1.0) * rng.gen::<f64>() + 1.0).powi(2) / a;
                    let j = rng.gen_range(other.clone());
                    let partner = &walkers[j].position;
                    let proposal: Vec<f64> = walkers[k]
                        .position
                        .iter()
                        .zip(partner)
                        .map(|(&x, &c)| c - z * (c - x))
                        .collect();
                    proposals.push(proposal);
                    stretches.push(z);
                }
                let values = self.log_posterior(evaluator, objective, &proposals, &mut n_evaluations)?;
                for (((k, proposal), z), (log_prob, log_likelihood)) in
                    active.zip(proposals).zip(stretches).zip(values)
                {
                    let log_ratio = (dim as f64 - 1.0) * z.ln() + log_prob - walkers[k].log_prob;
                    let u: f64 = rng.gen();
                    if log_prob.is_finite() && log_ratio > u.ln() {
                        walkers[k] = Walker {
                            position: proposal,
                            log_prob,
                            log_likelihood,
                        };
                        accepted += 1;
                    }
                }
            }
            chain.push(walkers.clone());
        }

        let acceptance = accepted as f64 / (nwalkers * self.config.nsteps).max(1) as f64;
        let burn = (self.config.burn_fraction * self.config.nsteps as f64) as usize;
        let thin = self.config.thin.max(1);
        let kept: Vec<&Walker> = chain
            .iter()
            .skip(burn)
            .step_by(thin)
            .flat_map(|step| step.iter())
            .collect();
        info!(
            "ensemble sampling finished: acceptance {:.3}, {} samples kept",
            acceptance,
            kept.len()
        );

        let positions = kept.iter().map(|w| w.position.clone()).collect();
        let log_likelihoods = kept.iter().map(|w| w.log_likelihood).collect();
        let weights = vec![1.0; kept.len()];
        let mut output = SamplerOutput::summarize(
            "ensemble_mcmc",
            self.space,
            positions,
            weights,
            log_likelihoods,
            self.config.seed,
        );
        output.n_evaluations = n_evaluations;
        output.acceptance_fraction = Some(acceptance);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::{CancelToken, FailurePolicy, LocalPool};
    use crate::sampler::testing::{square_space, UnitGaussian};

    fn evaluator() -> ParallelEvaluator {
        ParallelEvaluator::new(
            Box::new(LocalPool::new(2, 1e-3, None).unwrap()),
            FailurePolicy::default(),
            CancelToken::new(),
        )
    }

    #[test]
    fn samples_a_unit_gaussian() {
        let space = square_space();
        let config = EnsembleConfig {
            nwalkers: 20,
            nsteps: 400,
            thin: 5,
            start_jitter: 0.1,
            seed: 3,
            ..Default::default()
        };
        let output = EnsembleSampler::new(config, &space)
            .unwrap()
            .run(&evaluator(), &UnitGaussian)
            .unwrap();

        // 320 steps after burn-in, every 5th, 20 walkers
        assert_eq!(output.samples.len(), 64 * 20);
        assert_eq!(output.posterior, output.samples);
        assert!(output.mean.iter().all(|m| m.abs() < 0.35), "mean {:?}", output.mean);
        for i in 0..2 {
            let variance = output.covariance[i][i];
            assert!(variance > 0.5 && variance < 1.6, "variance {}", variance);
        }
        let acceptance = output.acceptance_fraction.unwrap();
        assert!(acceptance > 0.2 && acceptance < 0.95);
    }

    #[test]
    fn odd_or_too_few_walkers_are_rejected() {
        let space = square_space();
        for nwalkers in [7, 2] {
            let config = EnsembleConfig {
                nwalkers,
                ..Default::default()
            };
            assert!(matches!(
                EnsembleSampler::new(config, &space),
                Err(SamplerError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn proposals_outside_the_prior_are_not_evaluated() {
        let space = square_space();
        let config = EnsembleConfig {
            nwalkers: 4,
            nsteps: 0,
            ..Default::default()
        };
        let sampler = EnsembleSampler::new(config, &space).unwrap();
        let evaluator = evaluator();
        let mut evaluations = 0;
        let values = sampler
            .log_posterior(
                &evaluator,
                &UnitGaussian,
                &[vec![0.0, 0.0], vec![9.0, 0.0]],
                &mut evaluations,
            )
            .unwrap();
        assert_eq!(evaluations, 1);
        assert!(values[0].0.is_finite());
        assert_eq!(values[1].0, f64::NEG_INFINITY);
    }
}
