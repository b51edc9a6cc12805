use crate::parallel::cancel::CancelToken;
use crate::prelude::{InvalidKind, ObjectiveResult, ParameterVector};
use crate::statistics::objective::Objective;
use crate::telemetry::{EvaluationMetrics, LogManager, MetricsSnapshot};
use serde::{Deserialize, Serialize};

/// Terminal state of one scheduled evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(ObjectiveResult),
    Failed(String),
    TimedOut,
    /// Never started because the run was cancelled.
    Skipped,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvaluatorError {
    #[error("run cancelled")]
    Cancelled,
    #[error("{failed} of {total} evaluations failed, above the allowed fraction {threshold}")]
    Unhealthy {
        failed: usize,
        total: usize,
        threshold: f64,
    },
    #[error("backend returned {got} results for {expected} points")]
    BatchMismatch { expected: usize, got: usize },
    #[error("backend error: {0}")]
    Backend(String),
}

/// Runs a batch of evaluations somewhere and reports one outcome per point,
/// in input order.
pub trait EvaluationBackend: Send + Sync {
    fn name(&self) -> &str;

    fn run(
        &self,
        objective: &dyn Objective,
        points: &[ParameterVector],
        cancel: &CancelToken,
    ) -> Result<Vec<JobOutcome>, EvaluatorError>;
}

/// When accumulated worker failures abort the run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    /// Allowed share of failed or timed-out evaluations.
    pub max_failure_fraction: f64,
    /// The fraction is only enforced after this many evaluations.
    pub min_evaluations: usize,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_failure_fraction: 0.5,
            min_evaluations: 100,
        }
    }
}

impl FailurePolicy {
    fn check(&self, snapshot: &MetricsSnapshot) -> Result<(), EvaluatorError> {
        let total = snapshot.evaluated;
        if total < self.min_evaluations || total == 0 {
            return Ok(());
        }
        let failed = snapshot.unhealthy();
        if failed as f64 / total as f64 > self.max_failure_fraction {
            return Err(EvaluatorError::Unhealthy {
                failed,
                total,
                threshold: self.max_failure_fraction,
            });
        }
        Ok(())
    }
}

/// Order-preserving batch evaluation with failure isolation.
pub struct ParallelEvaluator {
    backend: Box<dyn EvaluationBackend>,
    policy: FailurePolicy,
    metrics: EvaluationMetrics,
    cancel: CancelToken,
    logger: LogManager,
}

impl ParallelEvaluator {
    pub fn new(backend: Box<dyn EvaluationBackend>, policy: FailurePolicy, cancel: CancelToken) -> Self {
        Self {
            backend,
            policy,
            metrics: EvaluationMetrics::new(),
            cancel,
            logger: LogManager::new("evaluator"),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn metrics(&self) -> &EvaluationMetrics {
        &self.metrics
    }

    /// Evaluate every point; `result[i]` belongs to `points[i]`.
    ///
    /// Individual failures come back as `Invalid` results. The call only
    /// fails on cancellation, a malformed backend reply, or when the failure
    /// policy trips.
    pub fn map(
        &self,
        objective: &dyn Objective,
        points: &[ParameterVector],
    ) -> Result<Vec<ObjectiveResult>, EvaluatorError> {
        if self.cancel.is_cancelled() {
            return Err(EvaluatorError::Cancelled);
        }
        if points.is_empty() {
            return Ok(Vec::new());
        }

        let outcomes = self.backend.run(objective, points, &self.cancel)?;
        if self.cancel.is_cancelled() {
            self.logger
                .record(&format!("discarding a batch of {} cancelled evaluations", points.len()));
            return Err(EvaluatorError::Cancelled);
        }
        if outcomes.len() != points.len() {
            return Err(EvaluatorError::BatchMismatch {
                expected: points.len(),
                got: outcomes.len(),
            });
        }
        self.metrics.record_batch();

        let results = outcomes
            .into_iter()
            .zip(points)
            .enumerate()
            .map(|(index, (outcome, point))| match outcome {
                JobOutcome::Completed(result) => {
                    if result.is_valid() {
                        self.metrics.record_valid();
                    } else {
                        self.metrics.record_invalid();
                    }
                    result
                }
                JobOutcome::Failed(reason) => {
                    self.fail(index, point, InvalidKind::WorkerFailure, reason)
                }
                JobOutcome::TimedOut => {
                    self.fail(index, point, InvalidKind::TimedOut, "timed out".to_string())
                }
                JobOutcome::Skipped => self.fail(
                    index,
                    point,
                    InvalidKind::WorkerFailure,
                    "skipped by backend".to_string(),
                ),
            })
            .collect();

        if let Err(err) = self.policy.check(&self.metrics.snapshot()) {
            self.logger.record(&err.to_string());
            return Err(err);
        }
        Ok(results)
    }

    fn fail(&self, index: usize, point: &ParameterVector, kind: InvalidKind, reason: String) -> ObjectiveResult {
        self.logger.record_failure(index, point, &reason);
        self.metrics.record_failure(point, kind, &reason);
        ObjectiveResult::invalid(kind, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::ParameterKind;
    use crate::statistics::objective::WorkerContext;

    struct Echo;

    impl Objective for Echo {
        fn evaluate(&self, _ctx: &mut WorkerContext, point: &ParameterVector) -> ObjectiveResult {
            ObjectiveResult::Valid(point.values()[0])
        }
    }

    /// Replays fixed outcomes, ignoring the objective.
    struct Scripted {
        outcomes: Vec<JobOutcome>,
        cancel_during_run: bool,
    }

    impl EvaluationBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn run(
            &self,
            _objective: &dyn Objective,
            _points: &[ParameterVector],
            cancel: &CancelToken,
        ) -> Result<Vec<JobOutcome>, EvaluatorError> {
            if self.cancel_during_run {
                cancel.cancel();
            }
            Ok(self.outcomes.clone())
        }
    }

    fn points(n: usize) -> Vec<ParameterVector> {
        (0..n)
            .map(|i| ParameterVector::from_values(&[ParameterKind::LogMass], &[i as f64]))
            .collect()
    }

    fn evaluator(outcomes: Vec<JobOutcome>, policy: FailurePolicy) -> ParallelEvaluator {
        ParallelEvaluator::new(
            Box::new(Scripted {
                outcomes,
                cancel_during_run: false,
            }),
            policy,
            CancelToken::new(),
        )
    }

    #[test]
    fn failed_jobs_become_invalid_results() {
        let outcomes = vec![
            JobOutcome::Completed(ObjectiveResult::Valid(-1.0)),
            JobOutcome::Failed("worker crashed".into()),
            JobOutcome::TimedOut,
        ];
        let evaluator = evaluator(outcomes, FailurePolicy::default());
        let results = evaluator.map(&Echo, &points(3)).unwrap();
        assert_eq!(results[0], ObjectiveResult::Valid(-1.0));
        assert!(matches!(&results[1], ObjectiveResult::Invalid(p) if p.kind == InvalidKind::WorkerFailure));
        assert!(matches!(&results[2], ObjectiveResult::Invalid(p) if p.kind == InvalidKind::TimedOut));
        assert_eq!(evaluator.metrics().failures().len(), 2);
    }

    #[test]
    fn short_reply_is_a_batch_mismatch() {
        let evaluator = evaluator(vec![JobOutcome::TimedOut], FailurePolicy::default());
        assert_eq!(
            evaluator.map(&Echo, &points(2)),
            Err(EvaluatorError::BatchMismatch { expected: 2, got: 1 })
        );
    }

    #[test]
    fn too_many_failures_trip_the_policy() {
        let outcomes = vec![JobOutcome::Failed("oom".into()); 4];
        let policy = FailurePolicy {
            max_failure_fraction: 0.25,
            min_evaluations: 4,
        };
        let evaluator = evaluator(outcomes, policy);
        assert!(matches!(
            evaluator.map(&Echo, &points(4)),
            Err(EvaluatorError::Unhealthy { failed: 4, total: 4, .. })
        ));
    }

    #[test]
    fn cancelled_batch_is_discarded() {
        let evaluator = ParallelEvaluator::new(
            Box::new(Scripted {
                outcomes: vec![JobOutcome::Completed(ObjectiveResult::Valid(0.0))],
                cancel_during_run: true,
            }),
            FailurePolicy::default(),
            CancelToken::new(),
        );
        assert_eq!(evaluator.map(&Echo, &points(1)), Err(EvaluatorError::Cancelled));
        assert_eq!(evaluator.map(&Echo, &points(1)), Err(EvaluatorError::Cancelled));
    }
}
