pub mod cancel;
pub mod cluster;
pub mod evaluator;
pub mod local;

pub use cancel::CancelToken;
pub use cluster::{run_job_batch, ClusterBackend, JobBatch, JobStatus, JobSubmitter};
pub use evaluator::{EvaluationBackend, EvaluatorError, FailurePolicy, JobOutcome, ParallelEvaluator};
pub use local::LocalPool;
