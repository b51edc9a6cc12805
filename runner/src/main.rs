use anyhow::Context;
use clap::{Parser, ValueEnum};
use dmcore::parallel::{run_job_batch, CancelToken, JobBatch};
use dmcore::sampler::{EnsembleConfig, NestedConfig, SamplerAdapter};
use log::{info, warn};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tokio::runtime::Builder as TokioBuilder;
use tokio::signal;
use workflow::config::{BackendConfig, RunConfig};
use workflow::runner::Runner;

mod cluster;
mod output;
mod workflow;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SamplerChoice {
    Nested,
    Ensemble,
}

#[derive(Parser)]
#[command(author, version, about = "Bayesian dark matter direct-detection inference driver")]
struct Args {
    /// Load a run config from YAML
    #[arg(long)]
    config: Option<PathBuf>,
    /// Evaluate a JSON job batch from stdin and print statuses to stdout
    #[arg(long, default_value_t = false)]
    worker: bool,
    /// Replace the configured sampler with its defaults
    #[arg(long, value_enum)]
    sampler: Option<SamplerChoice>,
    #[arg(long)]
    nlive: Option<usize>,
    #[arg(long)]
    tol: Option<f64>,
    /// Local worker threads
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    output: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut RunConfig) {
        match self.sampler {
            Some(SamplerChoice::Nested) if !matches!(config.sampler, SamplerAdapter::NestedSampling(_)) => {
                config.sampler = SamplerAdapter::NestedSampling(NestedConfig::default());
            }
            Some(SamplerChoice::Ensemble) if !matches!(config.sampler, SamplerAdapter::EnsembleMcmc(_)) => {
                config.sampler = SamplerAdapter::EnsembleMcmc(EnsembleConfig::default());
            }
            _ => {}
        }
        match &mut config.sampler {
            SamplerAdapter::NestedSampling(nested) => {
                if let Some(nlive) = self.nlive {
                    nested.nlive = nlive;
                }
                if let Some(tol) = self.tol {
                    nested.tol = tol;
                }
                if let Some(seed) = self.seed {
                    nested.seed = seed;
                }
            }
            SamplerAdapter::EnsembleMcmc(ensemble) => {
                if self.nlive.is_some() || self.tol.is_some() {
                    warn!("--nlive and --tol only apply to nested sampling");
                }
                if let Some(seed) = self.seed {
                    ensemble.seed = seed;
                }
            }
        }
        if let Some(workers) = self.workers {
            match &mut config.backend {
                BackendConfig::Local { workers: current, .. } => *current = workers,
                BackendConfig::Process { jobs, .. } => *jobs = workers,
            }
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
    }
}

fn run_worker() -> anyhow::Result<()> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .context("reading job batch from stdin")?;
    let batch: JobBatch = serde_json::from_str(&input).context("decoding job batch")?;
    let statuses = run_job_batch(&batch, std::process::id() as usize);
    let encoded = serde_json::to_vec(&statuses).context("encoding job statuses")?;
    let mut stdout = io::stdout().lock();
    stdout.write_all(&encoded).context("writing job statuses")?;
    stdout.flush()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.worker {
        return run_worker();
    }

    let path = args
        .config
        .clone()
        .context("--config is required unless running as a --worker")?;
    let mut config = RunConfig::load(path)?;
    args.apply(&mut config);
    config.validate().context("validating command-line overrides")?;

    let runtime = TokioBuilder::new_multi_thread()
        .enable_all()
        .build()
        .context("creating runtime for worker processes and signal handling")?;
    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    runtime.spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling after the current batch");
            on_interrupt.cancel();
        }
    });

    let result = Runner::new(config, runtime.handle().clone()).execute(cancel)?;
    let summary = &result.summary;
    info!(
        "{} finished in {:.1}s with {} evaluations",
        summary.sampler, summary.elapsed_secs, summary.n_evaluations
    );
    println!(
        "{} samples -> {}",
        summary.n_samples,
        result.output_dir.display()
    );
    for parameter in &summary.parameters {
        println!(
            "  {:<20} {:>12.5} +/- {:.5}",
            parameter.parameter, parameter.mean, parameter.std
        );
        if let (Some(name), Some(linear)) = (parameter.parameter.linear_name(), parameter.linear) {
            println!("  {:<20} {:>12.3e} +/- {:.2e}", name, linear.value, linear.error);
        }
    }
    println!("  {} equal-weight posterior draws", summary.n_posterior);
    if let Some(evidence) = summary.evidence {
        println!("  log Z = {:.3} +/- {:.3}", evidence.log_z, evidence.log_z_err);
    }
    if summary.metrics.failed + summary.metrics.timed_out > 0 {
        println!(
            "  {} evaluations failed, {} timed out (see failures.json)",
            summary.metrics.failed, summary.metrics.timed_out
        );
    }
    Ok(())
}
