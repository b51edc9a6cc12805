use anyhow::{bail, Context};
use dmcore::experiment::{preset, ExperimentConfig, ObservedData};
use dmcore::parallel::FailurePolicy;
use dmcore::physics::DarkMatterPoint;
use dmcore::sampler::SamplerAdapter;
use dmcore::statistics::{
    FittedParameter, LikelihoodSettings, NuisanceConstraint, ParameterSpace, ShieldingSettings,
};
use dmcore::ParameterKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A named preset, optionally with its own data source, or a full
/// experiment description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExperimentEntry {
    Preset {
        preset: String,
        #[serde(default)]
        data: Option<ObservedData>,
    },
    Custom(ExperimentConfig),
}

impl ExperimentEntry {
    pub fn resolve(&self) -> anyhow::Result<ExperimentConfig> {
        match self {
            ExperimentEntry::Preset { preset: name, data } => {
                let mut config = preset(name)?;
                if let Some(data) = data {
                    config.data = data.clone();
                }
                Ok(config)
            }
            ExperimentEntry::Custom(config) => Ok(config.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Rayon pool in this process.
    Local {
        #[serde(default = "default_workers")]
        workers: usize,
        #[serde(default)]
        timeout_secs: Option<f64>,
    },
    /// Worker subprocesses fed over stdin/stdout.
    Process {
        #[serde(default = "default_workers")]
        jobs: usize,
        #[serde(default = "default_job_timeout")]
        timeout_secs: f64,
        #[serde(default)]
        retries: usize,
        /// Worker executable; defaults to this binary in `--worker` mode.
        #[serde(default)]
        program: Option<PathBuf>,
    },
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_job_timeout() -> f64 {
    600.0
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            workers: default_workers(),
            timeout_secs: None,
        }
    }
}

fn default_benchmark() -> DarkMatterPoint {
    DarkMatterPoint {
        mass_gev: 50.0,
        cross_section_cm2: 1e-45,
        halo: Default::default(),
    }
}

fn default_fit() -> Vec<ParameterKind> {
    vec![ParameterKind::LogMass, ParameterKind::LogCrossSection]
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

/// Everything one inference run needs, loaded from YAML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub experiments: Vec<ExperimentEntry>,
    /// True point used for benchmark data and as the fixed values of
    /// parameters that are not fitted.
    #[serde(default = "default_benchmark")]
    pub benchmark: DarkMatterPoint,
    /// Parameters to fit with the Pato 2010 priors.
    #[serde(default = "default_fit")]
    pub fit: Vec<ParameterKind>,
    /// Explicit priors; replaces `fit` when given.
    #[serde(default)]
    pub priors: Option<Vec<FittedParameter>>,
    #[serde(default)]
    pub constraints: Vec<NuisanceConstraint>,
    #[serde(default)]
    pub sampler: SamplerAdapter,
    #[serde(default)]
    pub shielding: ShieldingSettings,
    #[serde(default)]
    pub likelihood: LikelihoodSettings,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl RunConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading run config {}", path_ref.display()))?;
        let config: RunConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing run config {}", path_ref.display()))?;
        config
            .validate()
            .with_context(|| format!("validating run config {}", path_ref.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.experiments.is_empty() {
            bail!("at least one experiment is required");
        }
        for entry in &self.experiments {
            entry.resolve()?.validate()?;
        }
        self.benchmark.validate().context("benchmark point")?;
        self.parameter_space()?;
        if !(0.0..=1.0).contains(&self.failure_policy.max_failure_fraction) {
            bail!(
                "max_failure_fraction must be within [0, 1], got {}",
                self.failure_policy.max_failure_fraction
            );
        }
        match &self.backend {
            BackendConfig::Local { workers, .. } if *workers == 0 => bail!("workers must be positive"),
            BackendConfig::Process { jobs, timeout_secs, .. } if *jobs == 0 || !(*timeout_secs > 0.0) => {
                bail!("process backend needs positive jobs and timeout")
            }
            _ => Ok(()),
        }
    }

    pub fn experiment_configs(&self) -> anyhow::Result<Vec<ExperimentConfig>> {
        self.experiments.iter().map(ExperimentEntry::resolve).collect()
    }

    pub fn parameter_space(&self) -> anyhow::Result<ParameterSpace> {
        let space = match &self.priors {
            Some(priors) => ParameterSpace::new(priors.clone())?,
            None => ParameterSpace::pato_2010(&self.benchmark, &self.fit)?,
        };
        Ok(space)
    }
}
