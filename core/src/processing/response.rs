use crate::experiment::{Binning, ExperimentConfig};
use crate::math::matrix::MatrixHelper;
use crate::physics::rate::RateSpectrum;
use crate::prelude::{PhysicsError, PhysicsResult};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Expected counts per result bin, split into signal and background.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinnedCounts {
    pub binning: Binning,
    pub signal: Vec<f64>,
    pub background: Vec<f64>,
}

impl BinnedCounts {
    pub fn len(&self) -> usize {
        self.signal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signal.is_empty()
    }

    /// Signal plus background.
    pub fn expected(&self) -> Vec<f64> {
        self.signal
            .iter()
            .zip(&self.background)
            .map(|(s, b)| s + b)
            .collect()
    }

    pub fn total_signal(&self) -> f64 {
        self.signal.iter().sum()
    }
}

fn threshold_fraction(left: f64, right: f64, threshold: f64) -> f64 {
    if left >= threshold {
        1.0
    } else if right <= threshold {
        0.0
    } else {
        (right - threshold) / (right - left)
    }
}

fn clamp_counts(values: &mut [f64]) {
    for v in values.iter_mut() {
        if !v.is_finite() || *v < 0.0 {
            *v = 0.0;
        }
    }
}

/// Folds a differential rate through one detector.
///
/// The resolution kernel depends only on the configuration, so it is built
/// once and reused for every evaluation.
#[derive(Debug, Clone)]
pub struct DetectorResponse {
    config: ExperimentConfig,
    fine_energies: Vec<f64>,
    fine_width: f64,
    kernel: Option<Array2<f64>>,
}

impl DetectorResponse {
    pub fn new(config: &ExperimentConfig) -> Self {
        let fine_energies = config.fine_energies();
        let fine_width = config.binning.width() / config.rebin_factor.max(1) as f64;
        let kernel = Self::build_kernel(config, &fine_energies, fine_width);
        Self {
            config: config.clone(),
            fine_energies,
            fine_width,
            kernel,
        }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Column `j` spreads fine bin `j` over the grid with a Gaussian of
    /// width sigma(E_j). Columns narrower than one fine bin stay unsmeared.
    fn build_kernel(config: &ExperimentConfig, energies: &[f64], width: f64) -> Option<Array2<f64>> {
        let sigmas: Vec<Option<f64>> = energies.iter().map(|&e| config.resolution.sigma(e)).collect();
        if sigmas.iter().all(|s| s.is_none()) {
            return None;
        }
        let n = energies.len();
        let norm = 1.0 / (2.0 * std::f64::consts::PI).sqrt();
        let mut kernel = Array2::<f64>::zeros((n, n));
        for (j, sigma) in sigmas.iter().enumerate() {
            match sigma {
                Some(sigma) if *sigma >= width => {
                    for i in 0..n {
                        let z = (energies[i] - energies[j]) / sigma;
                        kernel[[i, j]] = width * norm / sigma * (-0.5 * z * z).exp();
                    }
                }
                _ => kernel[[j, j]] = 1.0,
            }
        }
        Some(kernel)
    }

    /// Expected counts for `spectrum`, which must be sampled on this
    /// experiment's fine energy grid.
    pub fn expected_counts(&self, spectrum: &RateSpectrum) -> PhysicsResult<BinnedCounts> {
        if spectrum.rates.len() != self.fine_energies.len() {
            return Err(PhysicsError::GridMismatch {
                expected: self.fine_energies.len(),
                got: spectrum.rates.len(),
            });
        }
        Ok(self.fold(&spectrum.rates))
    }

    fn fold(&self, rates: &[f64]) -> BinnedCounts {
        let mut sanitized = rates.to_vec();
        clamp_counts(&mut sanitized);
        let has_signal = sanitized.iter().any(|r| *r > 0.0);
        let rates = Array1::from(sanitized);
        let smeared = match &self.kernel {
            Some(kernel) if has_signal => {
                MatrixHelper::apply(kernel.view(), rates.view())
            }
            _ => rates,
        };

        let factor = self.config.rebin_factor.max(1);
        let edges = self.config.binning.edges();
        let effective = self.config.effective_exposure();
        let exposure = self.config.exposure_tonne_year;
        let threshold = self.config.threshold_kev;

        let mut signal = Vec::with_capacity(edges.len());
        let mut background = Vec::with_capacity(edges.len());
        for (k, &(left, right)) in edges.iter().enumerate() {
            let fine = k * factor..(k + 1) * factor;
            let fraction = threshold_fraction(left, right, threshold);

            let integrated: f64 = smeared
                .slice(ndarray::s![fine.clone()])
                .iter()
                .sum::<f64>()
                * self.fine_width;
            signal.push(integrated * effective * fraction);

            let bg: f64 = self.fine_energies[fine]
                .iter()
                .map(|&e| self.config.background.rate(e))
                .sum::<f64>()
                * self.fine_width;
            background.push(bg * exposure * fraction);
        }

        clamp_counts(&mut signal);
        clamp_counts(&mut background);
        BinnedCounts {
            binning: self.config.binning.clone(),
            signal,
            background,
        }
    }

    /// Counts with no dark-matter signal at all.
    pub fn background_only(&self) -> BinnedCounts {
        self.fold(&vec![0.0; self.fine_energies.len()])
    }
}
