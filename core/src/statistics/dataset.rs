use crate::experiment::{ExperimentConfig, ObservedData};
use crate::physics::halo::DarkMatterPoint;
use crate::physics::shielding::ShieldingCache;
use crate::prelude::{ConfigError, ConfigResult};
use crate::processing::DetectorResponse;
use crate::statistics::likelihood::Observations;
use crate::statistics::objective::{PreparedExperiment, SignalPipeline};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DatasetError {
    #[error("cannot draw poisson counts with mean {lambda}: {message}")]
    InvalidMean { lambda: f64, message: String },
}

/// Turns each experiment's data source into concrete observations.
pub struct DatasetBuilder<'a> {
    pipeline: &'a SignalPipeline,
    benchmark: DarkMatterPoint,
    cache: ShieldingCache,
}

impl<'a> DatasetBuilder<'a> {
    pub fn new(pipeline: &'a SignalPipeline, benchmark: DarkMatterPoint) -> Self {
        Self {
            pipeline,
            benchmark,
            cache: ShieldingCache::default(),
        }
    }

    pub fn prepare(&mut self, configs: &[ExperimentConfig]) -> ConfigResult<Vec<PreparedExperiment>> {
        if configs.is_empty() {
            return Err(ConfigError::NoExperiments);
        }
        configs
            .iter()
            .map(|config| -> ConfigResult<PreparedExperiment> {
                config.validate()?;
                let observations = self.observations(config)?;
                Ok(PreparedExperiment {
                    config: config.clone(),
                    observations,
                })
            })
            .collect()
    }

    pub fn observations(&mut self, config: &ExperimentConfig) -> ConfigResult<Observations> {
        let response = DetectorResponse::new(config);
        match &config.data {
            ObservedData::Counts { counts } => Ok(Observations::Counts {
                counts: counts.clone(),
            }),
            ObservedData::Events { energies_kev } => Ok(Observations::Events {
                energies_kev: energies_kev.clone(),
            }),
            ObservedData::Asimov => Ok(Observations::Counts {
                counts: response.background_only().expected(),
            }),
            ObservedData::Benchmark { poisson, seed } => {
                let expected = self
                    .pipeline
                    .expected_counts(&mut self.cache, &response, &self.benchmark)?
                    .expected();
                let counts = if *poisson {
                    poisson_realization(&expected, *seed).map_err(|err| ConfigError::Experiment {
                        experiment: config.name.clone(),
                        message: err.to_string(),
                    })?
                } else {
                    expected
                };
                info!(
                    "{}: benchmark data with {:.3} total counts ({})",
                    config.name,
                    counts.iter().sum::<f64>(),
                    if *poisson { "poisson" } else { "asimov" }
                );
                Ok(Observations::Counts { counts })
            }
        }
    }
}

/// One Poisson draw per bin from a seeded generator.
pub fn poisson_realization(expected: &[f64], seed: u64) -> Result<Vec<f64>, DatasetError> {
    let mut rng = StdRng::seed_from_u64(seed);
    expected
        .iter()
        .map(|&lambda| -> Result<f64, DatasetError> {
            if lambda <= 0.0 {
                return Ok(0.0);
            }
            if !lambda.is_finite() {
                return Err(DatasetError::InvalidMean {
                    lambda,
                    message: "mean is not finite".into(),
                });
            }
            let dist = Poisson::new(lambda).map_err(|err| DatasetError::InvalidMean {
                lambda,
                message: err.to_string(),
            })?;
            Ok(dist.sample(&mut rng))
        })
        .collect()
}
