use anyhow::Context;
use dmcore::sampler::{Evidence, ParameterSummary, SamplerOutput};
use dmcore::telemetry::{FailureRecord, MetricsSnapshot};
use dmcore::ParameterVector;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Compact record of a finished run, written as `summary.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub sampler: String,
    pub backend: String,
    pub parameter_names: Vec<String>,
    pub mean: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
    pub parameters: Vec<ParameterSummary>,
    pub evidence: Option<Evidence>,
    pub best_fit: Option<ParameterVector>,
    pub best_log_likelihood: Option<f64>,
    pub n_samples: usize,
    /// Equal-weight posterior draws written to `posterior.json`.
    pub n_posterior: usize,
    pub n_evaluations: usize,
    pub acceptance_fraction: Option<f64>,
    pub metrics: MetricsSnapshot,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn new(output: &SamplerOutput, backend: &str, metrics: MetricsSnapshot, elapsed_secs: f64) -> Self {
        let best = output.best_fit();
        Self {
            sampler: output.sampler.clone(),
            backend: backend.to_string(),
            parameter_names: output.parameter_names.clone(),
            mean: output.mean.clone(),
            covariance: output.covariance.clone(),
            parameters: output.parameters.clone(),
            evidence: output.evidence,
            best_fit: best.map(|(point, _)| point.clone()),
            best_log_likelihood: best.map(|(_, logl)| logl),
            n_samples: output.samples.len(),
            n_posterior: output.posterior.len(),
            n_evaluations: output.n_evaluations,
            acceptance_fraction: output.acceptance_fraction,
            metrics,
            elapsed_secs,
        }
    }
}

/// Writes run artifacts into a fresh directory under a results root.
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    /// Creates `<root>/run_<n>` with the first unused `n`.
    pub fn create(root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("creating results root {}", root.display()))?;
        let mut index = 0usize;
        loop {
            let dir = root.join(format!("run_{}", index));
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(Self { dir }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => index += 1,
                Err(err) => {
                    return Err(err).with_context(|| format!("creating run directory {}", dir.display()))
                }
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> anyhow::Result<PathBuf> {
        let path = self.dir.join(name);
        let contents = serde_json::to_string_pretty(value).with_context(|| format!("serializing {}", name))?;
        fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub fn write_config<T: Serialize>(&self, config: &T) -> anyhow::Result<PathBuf> {
        self.write_json("config.json", config)
    }

    pub fn write_summary(&self, summary: &RunSummary) -> anyhow::Result<PathBuf> {
        self.write_json("summary.json", summary)
    }

    pub fn write_samples(&self, output: &SamplerOutput) -> anyhow::Result<PathBuf> {
        self.write_json("samples.json", output)
    }

    pub fn write_posterior(&self, output: &SamplerOutput) -> anyhow::Result<PathBuf> {
        self.write_json("posterior.json", &output.posterior)
    }

    pub fn write_failures(&self, failures: &[FailureRecord]) -> anyhow::Result<PathBuf> {
        self.write_json("failures.json", &failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmcore::sampler::LinearEstimate;
    use dmcore::ParameterKind;

    fn output() -> SamplerOutput {
        let heavy = ParameterVector::from_values(&[ParameterKind::LogMass], &[2.0]);
        SamplerOutput {
            sampler: "ensemble_mcmc".into(),
            parameter_names: vec!["log_mass".into()],
            samples: vec![
                ParameterVector::from_values(&[ParameterKind::LogMass], &[1.0]),
                ParameterVector::from_values(&[ParameterKind::LogMass], &[2.0]),
            ],
            weights: vec![1.0, 1.0],
            log_likelihoods: vec![-4.0, -2.5],
            evidence: None,
            n_evaluations: 10,
            acceptance_fraction: Some(0.4),
            mean: vec![1.5],
            covariance: vec![vec![0.25]],
            parameters: vec![ParameterSummary {
                parameter: ParameterKind::LogMass,
                mean: 1.5,
                std: 0.5,
                linear: Some(LinearEstimate {
                    value: 10f64.powf(1.5),
                    error: 10f64.powf(1.5) * std::f64::consts::LN_10 * 0.5,
                }),
            }],
            posterior: vec![heavy.clone(), heavy],
        }
    }

    #[test]
    fn each_run_gets_a_fresh_directory() {
        let root = tempfile::tempdir().unwrap();
        let first = ReportWriter::create(root.path()).unwrap();
        let second = ReportWriter::create(root.path()).unwrap();
        assert_ne!(first.dir(), second.dir());
        assert!(second.dir().ends_with("run_1"));
    }

    #[test]
    fn summary_round_trips_through_disk() {
        let root = tempfile::tempdir().unwrap();
        let writer = ReportWriter::create(root.path()).unwrap();
        let summary = RunSummary::new(&output(), "local", MetricsSnapshot::default(), 1.5);
        let path = writer.write_summary(&summary).unwrap();
        writer.write_samples(&output()).unwrap();

        let read: RunSummary = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(read.best_log_likelihood, Some(-2.5));
        assert_eq!(
            read.best_fit.unwrap().get(ParameterKind::LogMass),
            Some(2.0)
        );
        assert!(writer.dir().join("samples.json").exists());
        assert_eq!(read.n_posterior, 2);
        assert_eq!(read.parameters[0].linear, output().parameters[0].linear);
    }

    #[test]
    fn posterior_file_holds_equal_weight_draws() {
        let root = tempfile::tempdir().unwrap();
        let writer = ReportWriter::create(root.path()).unwrap();
        let path = writer.write_posterior(&output()).unwrap();
        let draws: Vec<ParameterVector> = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(draws, output().posterior);
    }
}
