pub mod dataset;
pub mod likelihood;
pub mod objective;
pub mod priors;

pub use dataset::{DatasetBuilder, DatasetError};
pub use likelihood::{ExperimentLikelihood, LikelihoodResult, LikelihoodSettings, Observations};
pub use objective::{
    JointObjective, NuisanceConstraint, Objective, ObjectiveDefinition, PreparedExperiment,
    ShieldingSettings, SignalPipeline, WorkerContext,
};
pub use priors::{FittedParameter, ParameterSpace, Prior};
