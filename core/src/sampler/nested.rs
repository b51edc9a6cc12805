use crate::math::stats::StatsHelper;
use crate::parallel::ParallelEvaluator;
use crate::sampler::{Evidence, SamplerError, SamplerOutput};
use crate::statistics::objective::Objective;
use crate::statistics::priors::ParameterSpace;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NestedConfig {
    pub nlive: usize,
    /// Stop once the estimated remaining evidence is below this, in log units.
    pub tol: f64,
    /// Proposals evaluated together per refill.
    pub batch_size: usize,
    /// Linear growth of the live-point bounding box.
    pub enlargement: f64,
    pub max_iterations: usize,
    /// Consecutive refills without an improvement before giving up.
    pub max_stalled_batches: usize,
    pub seed: u64,
    /// Log-likelihood assigned to invalid points.
    pub invalid_log_likelihood: f64,
}

impl Default for NestedConfig {
    fn default() -> Self {
        Self {
            nlive: 1024,
            tol: 0.1,
            batch_size: 64,
            enlargement: 1.25,
            max_iterations: 1_000_000,
            max_stalled_batches: 200,
            seed: 0,
            invalid_log_likelihood: -1e30,
        }
    }
}

struct DeadPoint {
    unit: Vec<f64>,
    log_likelihood: f64,
    log_weight: f64,
}

/// Running evidence and information integrals.
struct EvidenceAccumulator {
    log_z: f64,
    h: f64,
}

impl EvidenceAccumulator {
    fn new() -> Self {
        Self {
            log_z: f64::NEG_INFINITY,
            h: 0.0,
        }
    }

    fn add(&mut self, log_weight: f64, log_likelihood: f64) {
        let log_z_new = StatsHelper::log_add_exp(self.log_z, log_weight);
        if log_z_new == f64::NEG_INFINITY {
            return;
        }
        let carried = if self.log_z == f64::NEG_INFINITY {
            0.0
        } else {
            (self.log_z - log_z_new).exp() * (self.h + self.log_z)
        };
        self.h = (log_weight - log_z_new).exp() * log_likelihood + carried - log_z_new;
        self.log_z = log_z_new;
    }
}

/// Single-bound nested sampling in the unit hypercube.
///
/// New points are drawn uniformly from the enlarged bounding box of the live
/// set. Draws are made in batches and queued, so the evaluator always sees
/// `batch_size` proposals at a time.
pub struct NestedSampler<'a> {
    config: NestedConfig,
    space: &'a ParameterSpace,
}

impl<'a> NestedSampler<'a> {
    pub fn new(config: NestedConfig, space: &'a ParameterSpace) -> Result<Self, SamplerError> {
        if config.nlive < 2 {
            return Err(SamplerError::InvalidConfig(format!(
                "nlive must be at least 2, got {}",
                config.nlive
            )));
        }
        if !(config.tol > 0.0) {
            return Err(SamplerError::InvalidConfig(format!(
                "tol must be positive, got {}",
                config.tol
            )));
        }
        if !(config.enlargement >= 1.0) {
            return Err(SamplerError::InvalidConfig(format!(
                "enlargement must be at least 1, got {}",
                config.enlargement
            )));
        }
        if !config.invalid_log_likelihood.is_finite() {
            return Err(SamplerError::InvalidConfig(
                "invalid_log_likelihood must be finite".into(),
            ));
        }
        Ok(Self { config, space })
    }

    fn evaluate(
        &self,
        evaluator: &ParallelEvaluator,
        objective: &dyn Objective,
        units: &[Vec<f64>],
    ) -> Result<Vec<f64>, SamplerError> {
        let points: Vec<_> = units.iter().map(|u| self.space.transform(u)).collect();
        Ok(evaluator
            .map(objective, &points)?
            .iter()
            .map(|r| r.value_or(self.config.invalid_log_likelihood))
            .collect())
    }

    fn bounding_box(&self, live: &[Vec<f64>]) -> Vec<(f64, f64)> {
        let dim = self.space.dim();
        (0..dim)
            .map(|d| {
                let (lo, hi) = live.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), u| {
                    (lo.min(u[d]), hi.max(u[d]))
                });
                let center = 0.5 * (lo + hi);
                let half = 0.5 * (hi - lo) * self.config.enlargement;
                ((center - half).max(0.0), (center + half).min(1.0))
            })
            .collect()
    }

    pub fn run(&self, evaluator: &ParallelEvaluator, objective: &dyn Objective) -> Result<SamplerOutput, SamplerError> {
        let nlive = self.config.nlive;
        let dim = self.space.dim();
        let batch_size = self.config.batch_size.max(1);
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let mut live_units: Vec<Vec<f64>> = (0..nlive)
            .map(|_| (0..dim).map(|_| rng.gen::<f64>()).collect())
            .collect();
        let mut live_logl = self.evaluate(evaluator, objective, &live_units)?;
        let mut n_evaluations = nlive;

        let mut accumulator = EvidenceAccumulator::new();
        let mut dead: Vec<DeadPoint> = Vec::new();
        let mut queue: VecDeque<(Vec<f64>, f64)> = VecDeque::new();
        let log_shrink = (1.0 - (-1.0 / nlive as f64).exp()).ln();
        let mut log_volume = 0.0;
        let mut stalled = 0;

        info!(
            "nested sampling: {} live points in {} dimensions, tol {}",
            nlive, dim, self.config.tol
        );

        for iteration in 0..self.config.max_iterations {
            let (worst, &threshold) = live_logl
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .ok_or(SamplerError::NoValidStart)?;

            let log_weight = log_volume + log_shrink + threshold;
            accumulator.add(log_weight, threshold);
            dead.push(DeadPoint {
                unit: live_units[worst].clone(),
                log_likelihood: threshold,
                log_weight,
            });
            log_volume -= 1.0 / nlive as f64;

            let max_logl = live_logl.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let remaining = StatsHelper::log_add_exp(accumulator.log_z, max_logl + log_volume) - accumulator.log_z;
            if remaining < self.config.tol {
                debug!("stopping after {} iterations, dlogz {:.4}", iteration + 1, remaining);
                break;
            }

            let replacement = loop {
                if let Some((unit, logl)) = queue.pop_front() {
                    if logl > threshold {
                        break Some((unit, logl));
                    }
                    continue;
                }
                if stalled >= self.config.max_stalled_batches {
                    break None;
                }
                let bounds = self.bounding_box(&live_units);
                let proposals: Vec<Vec<f64>> = (0..batch_size)
                    .map(|_| bounds.iter().map(|&(lo, hi)| rng.gen_range(lo..=hi)).collect())
                    .collect();
                let values = self.evaluate(evaluator, objective, &proposals)?;
                n_evaluations += proposals.len();
                if values.iter().any(|&v| v > threshold) {
                    stalled = 0;
                } else {
                    stalled += 1;
                }
                queue.extend(proposals.into_iter().zip(values));
            };

            match replacement {
                Some((unit, logl)) => {
                    live_units[worst] = unit;
                    live_logl[worst] = logl;
                }
                None => {
                    warn!(
                        "no proposal above log-likelihood {} after {} batches; stopping",
                        threshold, self.config.max_stalled_batches
                    );
                    live_units.swap_remove(worst);
                    live_logl.swap_remove(worst);
                    break;
                }
            }
        }

        // Remaining live points share the last volume equally.
        let log_live_weight = log_volume - (live_units.len() as f64).ln();
        for (unit, logl) in live_units.into_iter().zip(live_logl) {
            let log_weight = log_live_weight + logl;
            accumulator.add(log_weight, logl);
            dead.push(DeadPoint {
                unit,
                log_likelihood: logl,
                log_weight,
            });
        }

        let log_z = accumulator.log_z;
        let log_z_err = (accumulator.h.max(0.0) / nlive as f64).sqrt();
        info!(
            "nested sampling finished: logZ = {:.4} +/- {:.4}, {} evaluations",
            log_z, log_z_err, n_evaluations
        );

        let weights: Vec<f64> = dead.iter().map(|p| (p.log_weight - log_z).exp()).collect();
        let log_likelihoods = dead.iter().map(|p| p.log_likelihood).collect();
        let positions = dead
            .iter()
            .map(|p| self.space.transform(&p.unit).values())
            .collect();

        let mut output = SamplerOutput::summarize(
            "nested_sampling",
            self.space,
            positions,
            weights,
            log_likelihoods,
            self.config.seed,
        );
        output.evidence = Some(Evidence { log_z, log_z_err });
        output.n_evaluations = n_evaluations;
        Ok(output)
    }
}
