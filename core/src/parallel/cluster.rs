use crate::parallel::cancel::CancelToken;
use crate::parallel::evaluator::{EvaluationBackend, EvaluatorError, JobOutcome};
use crate::parallel::local::panic_message;
use crate::prelude::{ObjectiveResult, ParameterVector};
use crate::statistics::objective::{JointObjective, Objective, ObjectiveDefinition, WorkerContext};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};

/// Unit of work shipped to an external worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobBatch {
    pub objective: ObjectiveDefinition,
    pub points: Vec<ParameterVector>,
}

/// Terminal status of one job, as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded { result: ObjectiveResult },
    Failed { reason: String },
    TimedOut,
}

impl From<JobStatus> for JobOutcome {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Succeeded { result } => JobOutcome::Completed(result),
            JobStatus::Failed { reason } => JobOutcome::Failed(reason),
            JobStatus::TimedOut => JobOutcome::TimedOut,
        }
    }
}

/// Hands a batch to a scheduler and waits for every job to finish.
///
/// Returns one status per point, in order. Retries and resubmission are the
/// submitter's concern; an `Err` means the batch as a whole was lost.
pub trait JobSubmitter: Send + Sync {
    fn submit(&self, batch: &JobBatch, cancel: &CancelToken) -> Result<Vec<JobStatus>, String>;
}

/// Backend that evaluates out of process through a [`JobSubmitter`].
pub struct ClusterBackend {
    submitter: Box<dyn JobSubmitter>,
}

impl ClusterBackend {
    pub fn new(submitter: Box<dyn JobSubmitter>) -> Self {
        Self { submitter }
    }
}

impl EvaluationBackend for ClusterBackend {
    fn name(&self) -> &str {
        "cluster"
    }

    fn run(
        &self,
        objective: &dyn Objective,
        points: &[ParameterVector],
        cancel: &CancelToken,
    ) -> Result<Vec<JobOutcome>, EvaluatorError> {
        let definition = objective.definition().ok_or_else(|| {
            EvaluatorError::Backend("objective has no serializable description".into())
        })?;
        let batch = JobBatch {
            objective: definition.clone(),
            points: points.to_vec(),
        };
        let statuses = self
            .submitter
            .submit(&batch, cancel)
            .map_err(EvaluatorError::Backend)?;
        Ok(statuses.into_iter().map(JobOutcome::from).collect())
    }
}

/// Worker-side entry point: rebuild the objective and evaluate every point.
pub fn run_job_batch(batch: &JobBatch, worker_id: usize) -> Vec<JobStatus> {
    let objective = match JointObjective::from_definition(batch.objective.clone()) {
        Ok(objective) => objective,
        Err(err) => {
            warn!("worker {}: cannot rebuild objective: {}", worker_id, err);
            let reason = err.to_string();
            return batch
                .points
                .iter()
                .map(|_| JobStatus::Failed {
                    reason: reason.clone(),
                })
                .collect();
        }
    };
    let mut ctx = WorkerContext::new(worker_id, objective.cache_tolerance());
    let statuses = batch
        .points
        .iter()
        .map(|point| {
            match panic::catch_unwind(AssertUnwindSafe(|| objective.evaluate(&mut ctx, point))) {
                Ok(result) => JobStatus::Succeeded { result },
                Err(payload) => JobStatus::Failed {
                    reason: panic_message(payload),
                },
            }
        })
        .collect();
    let stats = ctx.cache.stats();
    info!(
        "worker {}: {} points, shielding cache {} hits / {} misses",
        worker_id,
        batch.points.len(),
        stats.hits,
        stats.misses
    );
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::preset;
    use crate::parallel::evaluator::{FailurePolicy, ParallelEvaluator};
    use crate::physics::halo::DarkMatterPoint;
    use crate::prelude::ParameterKind;
    use crate::statistics::likelihood::{LikelihoodSettings, Observations};
    use crate::statistics::objective::{PreparedExperiment, ShieldingSettings};
    use crate::statistics::priors::ParameterSpace;

    /// Round-trips the batch through JSON and runs it in-process.
    struct Loopback;

    impl JobSubmitter for Loopback {
        fn submit(&self, batch: &JobBatch, _cancel: &CancelToken) -> Result<Vec<JobStatus>, String> {
            let wire = serde_json::to_string(batch).map_err(|e| e.to_string())?;
            let received: JobBatch = serde_json::from_str(&wire).map_err(|e| e.to_string())?;
            let statuses = run_job_batch(&received, 0);
            let wire = serde_json::to_string(&statuses).map_err(|e| e.to_string())?;
            serde_json::from_str(&wire).map_err(|e| e.to_string())
        }
    }

    struct Lost;

    impl JobSubmitter for Lost {
        fn submit(&self, _batch: &JobBatch, _cancel: &CancelToken) -> Result<Vec<JobStatus>, String> {
            Err("scheduler unreachable".into())
        }
    }

    fn objective() -> JointObjective {
        let benchmark = DarkMatterPoint {
            mass_gev: 50.0,
            cross_section_cm2: 1e-45,
            halo: Default::default(),
        };
        let definition = ObjectiveDefinition {
            experiments: vec![PreparedExperiment {
                config: preset("Ge").unwrap(),
                observations: Observations::Counts {
                    counts: vec![0.0, 1.0, 2.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                },
            }],
            space: ParameterSpace::pato_2010(
                &benchmark,
                &[ParameterKind::LogMass, ParameterKind::LogCrossSection],
            )
            .unwrap(),
            fixed: benchmark,
            shielding: ShieldingSettings::default(),
            likelihood: LikelihoodSettings::default(),
            constraints: Vec::new(),
        };
        JointObjective::from_definition(definition).unwrap()
    }

    #[test]
    fn cluster_results_match_local_evaluation() {
        let objective = objective();
        let points: Vec<ParameterVector> = [(1.5, -45.0), (2.0, -46.0), (9.0, -45.0)]
            .iter()
            .map(|&(m, s)| objective.space().vector(&[m, s]))
            .collect();
        let evaluator = ParallelEvaluator::new(
            Box::new(ClusterBackend::new(Box::new(Loopback))),
            FailurePolicy::default(),
            CancelToken::new(),
        );
        let remote = evaluator.map(&objective, &points).unwrap();

        let mut ctx = WorkerContext::new(0, 1e-3);
        let local: Vec<ObjectiveResult> = points.iter().map(|p| objective.evaluate(&mut ctx, p)).collect();
        assert_eq!(remote, local);
        assert!(!remote[2].is_valid());
    }

    #[test]
    fn lost_batch_is_a_backend_error() {
        let backend = ClusterBackend::new(Box::new(Lost));
        let objective = objective();
        let points = vec![objective.space().vector(&[1.5, -45.0])];
        assert!(matches!(
            backend.run(&objective, &points, &CancelToken::new()),
            Err(EvaluatorError::Backend(_))
        ));
    }

    #[test]
    fn broken_definition_fails_every_job() {
        let mut batch = JobBatch {
            objective: objective().definition().cloned().unwrap(),
            points: vec![ParameterVector::from_values(&[ParameterKind::LogMass], &[1.0]); 2],
        };
        batch.objective.experiments.clear();
        let statuses = run_job_batch(&batch, 1);
        assert_eq!(statuses.len(), 2);
        assert!(statuses
            .iter()
            .all(|s| matches!(s, JobStatus::Failed { .. })));
    }
}
