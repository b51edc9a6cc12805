use crate::parallel::cancel::CancelToken;
use crate::parallel::evaluator::{EvaluationBackend, EvaluatorError, JobOutcome};
use crate::prelude::ParameterVector;
use crate::statistics::objective::{Objective, WorkerContext};
use log::debug;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("evaluation panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("evaluation panicked: {}", message)
    } else {
        "evaluation panicked".to_string()
    }
}

/// In-process backend on a dedicated rayon pool.
///
/// Each pool thread owns one [`WorkerContext`], so shielding caches stay
/// worker-local.
pub struct LocalPool {
    pool: ThreadPool,
    contexts: Vec<Mutex<WorkerContext>>,
    timeout: Option<Duration>,
}

impl LocalPool {
    /// Builds a pool of `workers` threads.
    ///
    /// `timeout` is soft. Rust threads cannot be interrupted, so an evaluation
    /// that overruns keeps its worker busy until it returns, and only then is
    /// reported as [`JobOutcome::TimedOut`]. Objectives that can hang need the
    /// process backend, which kills overrunning workers.
    pub fn new(workers: usize, cache_tolerance: f64, timeout: Option<Duration>) -> Result<Self, EvaluatorError> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("dm-worker-{}", i))
            .build()
            .map_err(|err| EvaluatorError::Backend(err.to_string()))?;
        let contexts = (0..workers)
            .map(|id| Mutex::new(WorkerContext::new(id, cache_tolerance)))
            .collect();
        Ok(Self {
            pool,
            contexts,
            timeout,
        })
    }

    pub fn workers(&self) -> usize {
        self.contexts.len()
    }

    fn context(&self) -> MutexGuard<'_, WorkerContext> {
        let index = rayon::current_thread_index().unwrap_or(0) % self.contexts.len();
        match self.contexts[index].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn evaluate_one(&self, objective: &dyn Objective, point: &ParameterVector, cancel: &CancelToken) -> JobOutcome {
        if cancel.is_cancelled() {
            return JobOutcome::Skipped;
        }
        let mut ctx = self.context();
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| objective.evaluate(&mut ctx, point)));
        let elapsed = started.elapsed();
        match outcome {
            Ok(_) if self.timeout.map_or(false, |limit| elapsed > limit) => {
                debug!("worker {} overran its budget: {:?}", ctx.worker_id, elapsed);
                JobOutcome::TimedOut
            }
            Ok(result) => JobOutcome::Completed(result),
            Err(payload) => JobOutcome::Failed(panic_message(payload)),
        }
    }
}

impl EvaluationBackend for LocalPool {
    fn name(&self) -> &str {
        "local"
    }

    fn run(
        &self,
        objective: &dyn Objective,
        points: &[ParameterVector],
        cancel: &CancelToken,
    ) -> Result<Vec<JobOutcome>, EvaluatorError> {
        Ok(self.pool.install(|| {
            points
                .par_iter()
                .map(|point| self.evaluate_one(objective, point, cancel))
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::evaluator::{FailurePolicy, ParallelEvaluator};
    use crate::prelude::{InvalidKind, ObjectiveResult, ParameterKind};
    use std::thread;

    /// Early points take longest, so completion order is reversed.
    struct SlowFirst;

    impl Objective for SlowFirst {
        fn evaluate(&self, _ctx: &mut WorkerContext, point: &ParameterVector) -> ObjectiveResult {
            let x = point.values()[0];
            thread::sleep(Duration::from_millis((20.0 - 2.0 * x) as u64));
            ObjectiveResult::Valid(-x)
        }
    }

    struct PanicsAtThree;

    impl Objective for PanicsAtThree {
        fn evaluate(&self, _ctx: &mut WorkerContext, point: &ParameterVector) -> ObjectiveResult {
            let x = point.values()[0];
            if x == 3.0 {
                panic!("numerical blow-up");
            }
            ObjectiveResult::Valid(x)
        }
    }

    fn points(n: usize) -> Vec<ParameterVector> {
        (0..n)
            .map(|i| ParameterVector::from_values(&[ParameterKind::LogMass], &[i as f64]))
            .collect()
    }

    fn evaluator(pool: LocalPool) -> ParallelEvaluator {
        ParallelEvaluator::new(Box::new(pool), FailurePolicy::default(), CancelToken::new())
    }

    #[test]
    fn results_keep_input_order() {
        let evaluator = evaluator(LocalPool::new(4, 1e-3, None).unwrap());
        let results = evaluator.map(&SlowFirst, &points(8)).unwrap();
        let values: Vec<f64> = results.iter().map(|r| r.value_or(f64::NAN)).collect();
        assert_eq!(values, vec![0.0, -1.0, -2.0, -3.0, -4.0, -5.0, -6.0, -7.0]);
    }

    #[test]
    fn one_panic_yields_one_invalid_result() {
        let evaluator = evaluator(LocalPool::new(3, 1e-3, None).unwrap());
        let results = evaluator.map(&PanicsAtThree, &points(6)).unwrap();
        assert_eq!(results.iter().filter(|r| r.is_valid()).count(), 5);
        match &results[3] {
            ObjectiveResult::Invalid(invalid) => {
                assert_eq!(invalid.kind, InvalidKind::WorkerFailure);
                assert!(invalid.reason.contains("numerical blow-up"));
            }
            other => panic!("expected invalid, got {:?}", other),
        }
        assert_eq!(evaluator.metrics().snapshot().failed, 1);
    }

    #[test]
    fn overrunning_evaluations_time_out() {
        let pool = LocalPool::new(2, 1e-3, Some(Duration::from_millis(1))).unwrap();
        let outcomes = pool
            .run(&SlowFirst, &points(2), &CancelToken::new())
            .unwrap();
        assert!(outcomes.iter().all(|o| *o == JobOutcome::TimedOut));
    }

    #[test]
    fn timed_out_evaluations_still_run_to_completion() {
        struct Finishes(std::sync::atomic::AtomicUsize);

        impl Objective for Finishes {
            fn evaluate(&self, _ctx: &mut WorkerContext, _point: &ParameterVector) -> ObjectiveResult {
                thread::sleep(Duration::from_millis(10));
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                ObjectiveResult::Valid(0.0)
            }
        }

        let objective = Finishes(std::sync::atomic::AtomicUsize::new(0));
        let pool = LocalPool::new(2, 1e-3, Some(Duration::from_millis(1))).unwrap();
        let outcomes = pool.run(&objective, &points(4), &CancelToken::new()).unwrap();
        assert!(outcomes.iter().all(|o| *o == JobOutcome::TimedOut));
        assert_eq!(objective.0.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[test]
    fn cancelled_pool_skips_work() {
        let pool = LocalPool::new(2, 1e-3, None).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcomes = pool.run(&SlowFirst, &points(3), &cancel).unwrap();
        assert!(outcomes.iter().all(|o| *o == JobOutcome::Skipped));
    }
}
