use crate::math::stats::StatsHelper;
use crate::processing::BinnedCounts;
use log::debug;
use serde::{Deserialize, Serialize};

/// Concrete observations for one experiment, resolved at run start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observations {
    /// Counts per result bin; non-integer values are allowed for Asimov data.
    Counts { counts: Vec<f64> },
    /// Individual recoil energies in keV.
    Events { energies_kev: Vec<f64> },
}

fn default_degenerate_log_likelihood() -> f64 {
    -1e30
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodSettings {
    /// Finite value reported when the expectation cannot explain the data.
    #[serde(default = "default_degenerate_log_likelihood")]
    pub degenerate_log_likelihood: f64,
}

impl Default for LikelihoodSettings {
    fn default() -> Self {
        Self {
            degenerate_log_likelihood: default_degenerate_log_likelihood(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodResult {
    pub experiment: String,
    pub log_likelihood: f64,
    pub degenerate: bool,
}

/// Poisson likelihood of one experiment's expected counts against its data.
#[derive(Debug, Clone)]
pub struct ExperimentLikelihood {
    name: String,
    settings: LikelihoodSettings,
}

impl ExperimentLikelihood {
    pub fn new(name: impl Into<String>, settings: LikelihoodSettings) -> Self {
        Self {
            name: name.into(),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_likelihood(&self, counts: &BinnedCounts, observed: &Observations) -> LikelihoodResult {
        let value = match observed {
            Observations::Counts { counts: data } => Self::binned(&counts.expected(), data),
            Observations::Events { energies_kev } => Self::unbinned(counts, energies_kev),
        };
        match value {
            Some(log_likelihood) if !log_likelihood.is_nan() => LikelihoodResult {
                experiment: self.name.clone(),
                log_likelihood,
                degenerate: false,
            },
            _ => {
                debug!("{}: degenerate likelihood, using floor", self.name);
                LikelihoodResult {
                    experiment: self.name.clone(),
                    log_likelihood: self.settings.degenerate_log_likelihood,
                    degenerate: true,
                }
            }
        }
    }

    /// Sum of per-bin Poisson log-probabilities. `None` when a bin with
    /// observed counts has no expectation.
    pub fn binned(expected: &[f64], observed: &[f64]) -> Option<f64> {
        if expected.len() != observed.len() {
            return None;
        }
        expected
            .iter()
            .zip(observed)
            .map(|(&lambda, &n)| StatsHelper::poisson_log_pmf(n, lambda))
            .sum()
    }

    /// Extended unbinned likelihood with a piecewise-constant event density.
    /// Events outside the binned range are ignored.
    pub fn unbinned(counts: &BinnedCounts, energies_kev: &[f64]) -> Option<f64> {
        let expected = counts.expected();
        let total: f64 = expected.iter().sum();
        let mut log_likelihood = -total;
        for &energy in energies_kev {
            let Some(bin) = counts.binning.bin_index(energy) else {
                continue;
            };
            let density = expected[bin] / counts.binning.width();
            if !(density > 0.0) {
                return None;
            }
            log_likelihood += density.ln();
        }
        Some(log_likelihood)
    }
}
