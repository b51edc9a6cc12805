//! Likelihood evaluation and multi-experiment combination for dark-matter
//! direct-detection inference.
//!
//! A sampler proposes parameter vectors; each one flows through the halo
//! velocity distribution (optionally shielded by the Earth's overburden), the
//! recoil-rate model, every experiment's detector response and likelihood, and
//! is combined into a single objective value. The `parallel` module fans those
//! evaluations out over workers and `sampler` drives the posterior exploration.

pub mod experiment;
pub mod math;
pub mod parallel;
pub mod physics;
pub mod prelude;
pub mod processing;
pub mod sampler;
pub mod statistics;
pub mod telemetry;

pub use prelude::{ObjectiveResult, ParameterKind, ParameterVector};
