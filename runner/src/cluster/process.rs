use anyhow::Context;
use dmcore::parallel::{CancelToken, JobBatch, JobStatus, JobSubmitter};
use log::{debug, warn};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::runtime::Handle;

/// Outcome of one worker subprocess.
enum ChunkResult {
    Done(Vec<JobStatus>),
    Failed(String),
    TimedOut,
}

#[derive(Clone, Debug)]
struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    retries: usize,
}

impl WorkerCommand {
    async fn run(self, chunk: JobBatch) -> ChunkResult {
        let mut attempt = 0;
        loop {
            match self.spawn_once(&chunk).await {
                ChunkResult::Failed(reason) if attempt < self.retries => {
                    attempt += 1;
                    warn!("worker attempt {} failed ({}); retrying", attempt, reason);
                }
                other => return other,
            }
        }
    }

    async fn spawn_once(&self, chunk: &JobBatch) -> ChunkResult {
        let payload = match serde_json::to_vec(chunk) {
            Ok(payload) => payload,
            Err(err) => return ChunkResult::Failed(format!("encoding batch: {}", err)),
        };
        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                return ChunkResult::Failed(format!("spawning {}: {}", self.program.display(), err))
            }
        };

        let stdin = child.stdin.take();
        let exchange = async move {
            if let Some(mut pipe) = stdin {
                pipe.write_all(&payload).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => ChunkResult::TimedOut,
            Ok(Err(err)) => ChunkResult::Failed(format!("talking to worker: {}", err)),
            Ok(Ok(output)) if !output.status.success() => ChunkResult::Failed(format!(
                "worker exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Ok(Ok(output)) => match serde_json::from_slice::<Vec<JobStatus>>(&output.stdout) {
                Ok(statuses) if statuses.len() == chunk.points.len() => ChunkResult::Done(statuses),
                Ok(statuses) => ChunkResult::Failed(format!(
                    "worker answered {} statuses for {} points",
                    statuses.len(),
                    chunk.points.len()
                )),
                Err(err) => ChunkResult::Failed(format!("decoding worker output: {}", err)),
            },
        }
    }
}

/// Runs each chunk of a batch in its own worker subprocess.
///
/// The worker receives its chunk as JSON on stdin and answers with a JSON
/// array of statuses on stdout. Chunks run concurrently on the given tokio
/// runtime, each under its own timeout; a worker that overruns is killed.
pub struct ProcessSubmitter {
    command: WorkerCommand,
    jobs: usize,
    handle: Handle,
}

impl ProcessSubmitter {
    pub fn new(program: PathBuf, args: Vec<String>, jobs: usize, timeout: Duration, handle: Handle) -> Self {
        Self {
            command: WorkerCommand {
                program,
                args,
                timeout,
                retries: 0,
            },
            jobs: jobs.max(1),
            handle,
        }
    }

    /// This executable in `--worker` mode.
    pub fn current_exe(jobs: usize, timeout: Duration, handle: Handle) -> anyhow::Result<Self> {
        let program = std::env::current_exe().context("locating the runner executable")?;
        Ok(Self::new(program, vec!["--worker".to_string()], jobs, timeout, handle))
    }

    /// Resubmit a chunk whose worker crashed, up to `retries` times.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.command.retries = retries;
        self
    }
}

impl JobSubmitter for ProcessSubmitter {
    fn submit(&self, batch: &JobBatch, cancel: &CancelToken) -> Result<Vec<JobStatus>, String> {
        if cancel.is_cancelled() {
            return Err("cancelled before submission".to_string());
        }
        if batch.points.is_empty() {
            return Ok(Vec::new());
        }
        let chunk_size = (batch.points.len() + self.jobs - 1) / self.jobs;
        let tasks: Vec<_> = batch
            .points
            .chunks(chunk_size)
            .map(|points| {
                let chunk = JobBatch {
                    objective: batch.objective.clone(),
                    points: points.to_vec(),
                };
                (points.len(), self.handle.spawn(self.command.clone().run(chunk)))
            })
            .collect();
        debug!(
            "submitted {} points as {} worker processes",
            batch.points.len(),
            tasks.len()
        );

        let mut statuses = Vec::with_capacity(batch.points.len());
        for (size, task) in tasks {
            let result = self
                .handle
                .block_on(task)
                .unwrap_or_else(|err| ChunkResult::Failed(format!("worker task aborted: {}", err)));
            match result {
                ChunkResult::Done(chunk) => statuses.extend(chunk),
                ChunkResult::TimedOut => statuses.extend((0..size).map(|_| JobStatus::TimedOut)),
                ChunkResult::Failed(reason) => statuses.extend((0..size).map(|_| JobStatus::Failed {
                    reason: reason.clone(),
                })),
            }
        }
        Ok(statuses)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use dmcore::experiment::preset;
    use dmcore::physics::DarkMatterPoint;
    use dmcore::statistics::{
        LikelihoodSettings, ObjectiveDefinition, Observations, ParameterSpace, PreparedExperiment,
        ShieldingSettings,
    };
    use dmcore::{ParameterKind, ParameterVector};
    use tokio::runtime::Runtime;

    fn batch(points: usize) -> JobBatch {
        let benchmark = DarkMatterPoint {
            mass_gev: 50.0,
            cross_section_cm2: 1e-45,
            halo: Default::default(),
        };
        let objective = ObjectiveDefinition {
            experiments: vec![PreparedExperiment {
                config: preset("Xe").unwrap(),
                observations: Observations::Counts {
                    counts: vec![0.0; 10],
                },
            }],
            space: ParameterSpace::pato_2010(&benchmark, &[ParameterKind::LogMass]).unwrap(),
            fixed: benchmark,
            shielding: ShieldingSettings::default(),
            likelihood: LikelihoodSettings::default(),
            constraints: Vec::new(),
        };
        JobBatch {
            objective,
            points: (0..points)
                .map(|i| ParameterVector::from_values(&[ParameterKind::LogMass], &[1.0 + i as f64 * 0.1]))
                .collect(),
        }
    }

    fn shell(script: &str, jobs: usize, timeout: Duration, runtime: &Runtime) -> ProcessSubmitter {
        ProcessSubmitter::new(
            PathBuf::from("sh"),
            vec!["-c".to_string(), script.to_string()],
            jobs,
            timeout,
            runtime.handle().clone(),
        )
    }

    #[test]
    fn statuses_are_read_from_worker_stdout() {
        let runtime = Runtime::new().unwrap();
        let submitter = shell(
            r#"cat > /dev/null; printf '[{"status":"timed_out"},{"status":"failed","reason":"nan"}]'"#,
            2,
            Duration::from_secs(10),
            &runtime,
        );
        let statuses = submitter.submit(&batch(4), &CancelToken::new()).unwrap();
        assert_eq!(statuses.len(), 4);
        assert_eq!(statuses[0], JobStatus::TimedOut);
        assert_eq!(
            statuses[3],
            JobStatus::Failed {
                reason: "nan".to_string()
            }
        );
    }

    #[test]
    fn crashing_worker_fails_its_chunk() {
        let runtime = Runtime::new().unwrap();
        let submitter = shell("cat > /dev/null; echo boom >&2; exit 3", 1, Duration::from_secs(10), &runtime)
            .with_retries(1);
        let statuses = submitter.submit(&batch(2), &CancelToken::new()).unwrap();
        assert!(statuses.iter().all(|s| match s {
            JobStatus::Failed { reason } => reason.contains("boom"),
            _ => false,
        }));
    }

    #[test]
    fn slow_worker_times_out() {
        let runtime = Runtime::new().unwrap();
        let submitter = shell("sleep 5", 1, Duration::from_millis(200), &runtime);
        let statuses = submitter.submit(&batch(3), &CancelToken::new()).unwrap();
        assert_eq!(statuses, vec![JobStatus::TimedOut; 3]);
    }

    #[test]
    fn cancelled_run_submits_nothing() {
        let runtime = Runtime::new().unwrap();
        let submitter = shell("exit 0", 1, Duration::from_secs(1), &runtime);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(submitter.submit(&batch(1), &cancel).is_err());
    }
}
