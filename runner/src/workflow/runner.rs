use crate::cluster::process::ProcessSubmitter;
use crate::output::report::{ReportWriter, RunSummary};
use crate::workflow::config::{BackendConfig, RunConfig};
use anyhow::Context;
use dmcore::parallel::{
    CancelToken, ClusterBackend, EvaluationBackend, LocalPool, ParallelEvaluator,
};
use dmcore::statistics::{DatasetBuilder, JointObjective, ObjectiveDefinition, SignalPipeline};
use log::info;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

pub struct WorkflowResult {
    pub summary: RunSummary,
    pub output_dir: PathBuf,
}

/// Drives one inference run from a loaded [`RunConfig`].
pub struct Runner {
    config: RunConfig,
    handle: Handle,
}

impl Runner {
    pub fn new(config: RunConfig, handle: Handle) -> Self {
        Self { config, handle }
    }

    /// Resolve experiments and observations into a serializable objective.
    pub fn build_definition(&self) -> anyhow::Result<ObjectiveDefinition> {
        let configs = self.config.experiment_configs()?;
        let pipeline = SignalPipeline::standard(self.config.shielding);
        let experiments = DatasetBuilder::new(&pipeline, self.config.benchmark)
            .prepare(&configs)
            .context("preparing observations")?;
        let definition = ObjectiveDefinition {
            experiments,
            space: self.config.parameter_space()?,
            fixed: self.config.benchmark,
            shielding: self.config.shielding,
            likelihood: self.config.likelihood,
            constraints: self.config.constraints.clone(),
        };
        definition.validate().context("validating objective")?;
        Ok(definition)
    }

    fn backend(&self) -> anyhow::Result<Box<dyn EvaluationBackend>> {
        let backend: Box<dyn EvaluationBackend> = match &self.config.backend {
            BackendConfig::Local {
                workers,
                timeout_secs,
            } => Box::new(
                LocalPool::new(
                    *workers,
                    self.config.shielding.cache_tolerance,
                    timeout_secs.map(Duration::from_secs_f64),
                )
                .context("starting local worker pool")?,
            ),
            BackendConfig::Process {
                jobs,
                timeout_secs,
                retries,
                program,
            } => {
                let timeout = Duration::from_secs_f64(*timeout_secs);
                let submitter = match program {
                    Some(program) => ProcessSubmitter::new(
                        program.clone(),
                        vec!["--worker".to_string()],
                        *jobs,
                        timeout,
                        self.handle.clone(),
                    ),
                    None => ProcessSubmitter::current_exe(*jobs, timeout, self.handle.clone())?,
                };
                Box::new(ClusterBackend::new(Box::new(submitter.with_retries(*retries))))
            }
        };
        Ok(backend)
    }

    pub fn execute(&self, cancel: CancelToken) -> anyhow::Result<WorkflowResult> {
        let started = Instant::now();
        let definition = self.build_definition()?;
        let space = definition.space.clone();
        let objective = JointObjective::from_definition(definition).context("building joint objective")?;

        let evaluator = ParallelEvaluator::new(self.backend()?, self.config.failure_policy, cancel);
        info!(
            "running {} over {} with {} experiments on the {} backend",
            self.config.sampler.name(),
            space.names().join(", "),
            self.config.experiments.len(),
            evaluator.backend_name()
        );

        let output = self
            .config
            .sampler
            .run(&evaluator, &objective, &space)
            .context("sampling the posterior")?;

        let summary = RunSummary::new(
            &output,
            evaluator.backend_name(),
            evaluator.metrics().snapshot(),
            started.elapsed().as_secs_f64(),
        );
        let writer = ReportWriter::create(&self.config.output_dir)?;
        writer.write_config(&self.config)?;
        writer.write_summary(&summary)?;
        writer.write_samples(&output)?;
        writer.write_posterior(&output)?;
        let failures = evaluator.metrics().failures();
        if !failures.is_empty() {
            writer.write_failures(&failures)?;
        }
        info!("results written to {}", writer.dir().display());

        Ok(WorkflowResult {
            summary,
            output_dir: writer.dir().to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::config::ExperimentEntry;
    use dmcore::experiment::ObservedData;
    use dmcore::sampler::{EnsembleConfig, SamplerAdapter};
    use tokio::runtime::Runtime;

    fn config(output_dir: PathBuf) -> RunConfig {
        let yaml = "experiments:\n  - preset: Xe\n  - preset: Ge\n";
        let mut cfg: RunConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.output_dir = output_dir;
        cfg.backend = BackendConfig::Local {
            workers: 2,
            timeout_secs: None,
        };
        cfg.sampler = SamplerAdapter::EnsembleMcmc(EnsembleConfig {
            nwalkers: 8,
            nsteps: 10,
            thin: 1,
            seed: 5,
            ..Default::default()
        });
        cfg
    }

    #[test]
    fn small_ensemble_run_writes_all_outputs() {
        let runtime = Runtime::new().unwrap();
        let root = tempfile::tempdir().unwrap();
        let runner = Runner::new(config(root.path().to_path_buf()), runtime.handle().clone());
        let result = runner.execute(CancelToken::new()).unwrap();

        assert_eq!(result.summary.n_samples, 8 * 8);
        assert_eq!(result.summary.parameter_names, vec!["log_mass", "log_cross_section"]);
        assert_eq!(result.summary.n_posterior, 8 * 8);
        assert!(result.summary.parameters.iter().all(|p| p.linear.is_some()));
        for name in ["config.json", "summary.json", "samples.json", "posterior.json"] {
            assert!(result.output_dir.join(name).exists(), "{} missing", name);
        }
    }

    #[test]
    fn objective_uses_benchmark_data() {
        let runtime = Runtime::new().unwrap();
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(root.path().to_path_buf());
        cfg.experiments.push(ExperimentEntry::Preset {
            preset: "Ar".into(),
            data: Some(ObservedData::Asimov),
        });
        let definition = Runner::new(cfg, runtime.handle().clone()).build_definition().unwrap();
        assert_eq!(definition.experiments.len(), 3);
        assert_eq!(definition.fixed.mass_gev, 50.0);
    }

    #[test]
    fn cancelled_run_fails_without_output() {
        let runtime = Runtime::new().unwrap();
        let root = tempfile::tempdir().unwrap();
        let runner = Runner::new(config(root.path().to_path_buf()), runtime.handle().clone());
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(runner.execute(cancel).is_err());
        assert!(!root.path().join("run_0").exists());
    }
}
