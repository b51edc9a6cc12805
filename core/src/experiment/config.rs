use crate::prelude::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

/// Detector target nucleus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    Xe,
    Ge,
    Ar,
    Si,
}

impl Target {
    pub fn mass_number(&self) -> f64 {
        match self {
            Target::Xe => 131.0,
            Target::Ge => 73.0,
            Target::Ar => 40.0,
            Target::Si => 28.0,
        }
    }
}

/// Uniform energy binning of the final result, in keV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binning {
    pub e_min_kev: f64,
    pub e_max_kev: f64,
    pub n_bins: usize,
}

impl Binning {
    pub fn width(&self) -> f64 {
        (self.e_max_kev - self.e_min_kev) / self.n_bins as f64
    }

    /// `(left, right)` for every bin.
    pub fn edges(&self) -> Vec<(f64, f64)> {
        let width = self.width();
        (0..self.n_bins)
            .map(|i| {
                let left = self.e_min_kev + i as f64 * width;
                (left, left + width)
            })
            .collect()
    }

    /// Centers of a grid `factor` times finer than this binning.
    pub fn refined_centers(&self, factor: usize) -> Vec<f64> {
        let fine_bins = self.n_bins * factor.max(1);
        let width = (self.e_max_kev - self.e_min_kev) / fine_bins as f64;
        (0..fine_bins)
            .map(|i| self.e_min_kev + (i as f64 + 0.5) * width)
            .collect()
    }

    /// Index of the bin containing `energy`, right edge of the last bin inclusive.
    pub fn bin_index(&self, energy: f64) -> Option<usize> {
        let last = self.n_bins.checked_sub(1)?;
        if !(self.e_min_kev..=self.e_max_kev).contains(&energy) {
            return None;
        }
        let idx = ((energy - self.e_min_kev) / self.width()) as usize;
        Some(idx.min(last))
    }
}

/// Energy resolution sigma(E) in keV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum Resolution {
    #[default]
    None,
    /// `coefficient * sqrt(E)`
    SqrtScaled { coefficient: f64 },
    /// `sqrt(constant^2 + slope^2 * E)`
    Quadrature { constant: f64, slope: f64 },
    /// `sqrt(noise^2 + linear * E + (quadratic * E)^2)`
    Polynomial {
        noise: f64,
        linear: f64,
        quadratic: f64,
    },
    Constant { sigma: f64 },
}

impl Resolution {
    pub fn sigma(&self, energy_kev: f64) -> Option<f64> {
        let e = energy_kev.max(0.0);
        match *self {
            Resolution::None => None,
            Resolution::SqrtScaled { coefficient } => Some(coefficient * e.sqrt()),
            Resolution::Quadrature { constant, slope } => {
                Some((constant * constant + slope * slope * e).sqrt())
            }
            Resolution::Polynomial {
                noise,
                linear,
                quadratic,
            } => Some((noise * noise + linear * e + (quadratic * e).powi(2)).sqrt()),
            Resolution::Constant { sigma } => Some(sigma),
        }
    }
}

/// Background rate in events / keV / tonne / year, already corrected for
/// detector efficiencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum Background {
    #[default]
    None,
    Flat { rate: f64 },
    /// `rates[i]` applies below `breaks_kev[i]`; the last rate applies above
    /// the final break.
    Piecewise { breaks_kev: Vec<f64>, rates: Vec<f64> },
}

impl Background {
    pub fn rate(&self, energy_kev: f64) -> f64 {
        match self {
            Background::None => 0.0,
            Background::Flat { rate } => *rate,
            Background::Piecewise { breaks_kev, rates } => {
                let idx = breaks_kev.partition_point(|&b| b <= energy_kev);
                rates.get(idx).copied().unwrap_or(0.0)
            }
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Background::None)
    }
}

/// Where the observations for an experiment come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservedData {
    /// Measured counts per result bin.
    Counts { counts: Vec<f64> },
    /// Measured recoil energies for the unbinned likelihood.
    Events { energies_kev: Vec<f64> },
    /// Background-only expectation, for projected sensitivity.
    Asimov,
    /// Generated from the run's benchmark point.
    Benchmark {
        #[serde(default)]
        poisson: bool,
        #[serde(default)]
        seed: u64,
    },
}

impl Default for ObservedData {
    fn default() -> Self {
        ObservedData::Benchmark {
            poisson: false,
            seed: 0,
        }
    }
}

fn default_efficiency() -> f64 {
    1.0
}

fn default_rebin_factor() -> usize {
    10
}

/// Static description of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub target: Target,
    pub exposure_tonne_year: f64,
    #[serde(default = "default_efficiency")]
    pub cut_efficiency: f64,
    #[serde(default = "default_efficiency")]
    pub nr_efficiency: f64,
    pub threshold_kev: f64,
    pub binning: Binning,
    #[serde(default = "default_rebin_factor")]
    pub rebin_factor: usize,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub background: Background,
    /// Underground site; enables Earth shielding when the run asks for it.
    #[serde(default)]
    pub location: Option<String>,
    /// Overrides the site's default overburden.
    #[serde(default)]
    pub depth_km: Option<f64>,
    #[serde(default)]
    pub data: ObservedData,
}

impl ExperimentConfig {
    pub fn effective_exposure(&self) -> f64 {
        self.exposure_tonne_year * self.cut_efficiency * self.nr_efficiency
    }

    pub fn fine_energies(&self) -> Vec<f64> {
        self.binning.refined_centers(self.rebin_factor)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let fail = |message: String| {
            Err(ConfigError::Experiment {
                experiment: self.name.clone(),
                message,
            })
        };

        if self.name.trim().is_empty() {
            return fail("experiment name is empty".into());
        }
        if !(self.exposure_tonne_year > 0.0) {
            return fail(format!("exposure must be positive, got {}", self.exposure_tonne_year));
        }
        for (label, eff) in [("cut", self.cut_efficiency), ("nr", self.nr_efficiency)] {
            if !(eff > 0.0 && eff <= 1.0) {
                return fail(format!("{} efficiency must be in (0, 1], got {}", label, eff));
            }
        }
        if self.binning.n_bins == 0 {
            return fail("binning needs at least one bin".into());
        }
        if !(self.binning.e_min_kev >= 0.0 && self.binning.e_max_kev > self.binning.e_min_kev) {
            return fail(format!(
                "energy range [{}, {}] keV is not increasing",
                self.binning.e_min_kev, self.binning.e_max_kev
            ));
        }
        if !(self.threshold_kev >= 0.0) {
            return fail(format!("threshold must be non-negative, got {}", self.threshold_kev));
        }
        if self.rebin_factor == 0 {
            return fail("rebin factor must be at least 1".into());
        }
        if let Background::Piecewise { breaks_kev, rates } = &self.background {
            if rates.len() != breaks_kev.len() + 1 {
                return fail("piecewise background needs one more rate than breaks".into());
            }
            if breaks_kev.windows(2).any(|w| w[1] <= w[0]) {
                return fail("piecewise background breaks must increase".into());
            }
        }
        if let Some(depth) = self.depth_km {
            if !(depth >= 0.0) {
                return fail(format!("depth must be non-negative, got {}", depth));
            }
        }
        match &self.data {
            ObservedData::Counts { counts } => {
                if counts.len() != self.binning.n_bins {
                    return fail(format!(
                        "{} observed bins for {} configured bins",
                        counts.len(),
                        self.binning.n_bins
                    ));
                }
                if counts.iter().any(|c| !(*c >= 0.0)) {
                    return fail("observed counts must be non-negative".into());
                }
            }
            ObservedData::Events { energies_kev } => {
                if energies_kev.iter().any(|e| !e.is_finite()) {
                    return fail("event energies must be finite".into());
                }
            }
            ObservedData::Asimov | ObservedData::Benchmark { .. } => {}
        }
        Ok(())
    }
}
