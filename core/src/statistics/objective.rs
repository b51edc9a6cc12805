use crate::experiment::{ExperimentConfig, Site};
use crate::physics::halo::{DarkMatterPoint, StandardHalo, VelocityDistribution};
use crate::physics::rate::RateModel;
use crate::physics::shielding::{ContinuousSlowdown, ShieldingCache, ShieldingModel};
use crate::prelude::{
    ConfigError, ConfigResult, ObjectiveResult, ParameterKind, ParameterVector, PhysicsError,
    PhysicsResult,
};
use crate::processing::{BinnedCounts, DetectorResponse};
use crate::statistics::likelihood::{
    ExperimentLikelihood, LikelihoodResult, LikelihoodSettings, Observations,
};
use crate::statistics::priors::ParameterSpace;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldingSettings {
    pub enabled: bool,
    pub attenuation_kmwe: f64,
    pub grid_points: usize,
    pub cache_tolerance: f64,
}

impl Default for ShieldingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            attenuation_kmwe: 10.0,
            grid_points: StandardHalo::DEFAULT_GRID_POINTS,
            cache_tolerance: ShieldingCache::DEFAULT_TOLERANCE,
        }
    }
}

impl ShieldingSettings {
    pub fn model(&self) -> ContinuousSlowdown {
        ContinuousSlowdown {
            attenuation_kmwe: self.attenuation_kmwe,
            grid_points: self.grid_points,
        }
    }
}

/// Gaussian constraint on a nuisance parameter, added as a log-prior term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NuisanceConstraint {
    pub parameter: ParameterKind,
    pub mean: f64,
    pub std: f64,
}

impl NuisanceConstraint {
    fn log_density(&self, value: f64) -> f64 {
        let z = (value - self.mean) / self.std;
        -0.5 * z * z - (self.std * (2.0 * std::f64::consts::PI).sqrt()).ln()
    }
}

/// Experiment with its observations already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedExperiment {
    pub config: ExperimentConfig,
    pub observations: Observations,
}

/// Everything a worker needs to rebuild the objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveDefinition {
    pub experiments: Vec<PreparedExperiment>,
    pub space: ParameterSpace,
    /// Values for parameters the sampler does not vary.
    pub fixed: DarkMatterPoint,
    #[serde(default)]
    pub shielding: ShieldingSettings,
    #[serde(default)]
    pub likelihood: LikelihoodSettings,
    #[serde(default)]
    pub constraints: Vec<NuisanceConstraint>,
}

impl ObjectiveDefinition {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.experiments.is_empty() {
            return Err(ConfigError::NoExperiments);
        }
        self.space.validate()?;
        for prepared in &self.experiments {
            let config = &prepared.config;
            config.validate()?;
            if let Observations::Counts { counts } = &prepared.observations {
                if counts.len() != config.binning.n_bins {
                    return Err(ConfigError::Experiment {
                        experiment: config.name.clone(),
                        message: format!(
                            "{} observed bins for {} expected bins",
                            counts.len(),
                            config.binning.n_bins
                        ),
                    });
                }
                if counts.iter().any(|c| !(c.is_finite() && *c >= 0.0)) {
                    return Err(ConfigError::Experiment {
                        experiment: config.name.clone(),
                        message: "observed counts must be finite and non-negative".into(),
                    });
                }
            }
            if self.shielding.enabled {
                if let Some(location) = &config.location {
                    Site::lookup(location)?;
                }
            }
        }
        for constraint in &self.constraints {
            if !(constraint.std > 0.0 && constraint.std.is_finite()) {
                return Err(ConfigError::MalformedPrior {
                    parameter: constraint.parameter,
                    message: format!("constraint width must be positive, got {}", constraint.std),
                });
            }
        }
        if !self.likelihood.degenerate_log_likelihood.is_finite() {
            return Err(ConfigError::InvalidSetting(
                "degenerate_log_likelihood must be finite".into(),
            ));
        }
        Ok(())
    }

    /// Apply `point` on top of the fixed values.
    pub fn resolve(&self, point: &ParameterVector) -> PhysicsResult<DarkMatterPoint> {
        let mut resolved = self.fixed;
        for &(kind, value) in point.iter() {
            if let Some(prior) = self.space.prior(kind) {
                if !prior.contains(value) {
                    let (low, high) = prior.bounds();
                    return Err(PhysicsError::OutOfPrior {
                        parameter: kind,
                        value,
                        low,
                        high,
                    });
                }
            }
            match kind {
                ParameterKind::LogMass => resolved.mass_gev = 10f64.powf(value),
                ParameterKind::LogCrossSection => resolved.cross_section_cm2 = 10f64.powf(value),
                ParameterKind::V0 => resolved.halo.velocity.v_0 = value,
                ParameterKind::VEsc => resolved.halo.velocity.v_esc = value,
                ParameterKind::Density => resolved.halo.density = value,
            }
        }
        resolved.validate()?;
        Ok(resolved)
    }
}

/// Mutable per-worker state. One per worker thread or process.
#[derive(Debug)]
pub struct WorkerContext {
    pub worker_id: usize,
    pub cache: ShieldingCache,
}

impl WorkerContext {
    pub fn new(worker_id: usize, cache_tolerance: f64) -> Self {
        Self {
            worker_id,
            cache: ShieldingCache::new(cache_tolerance),
        }
    }
}

/// Scalar log-likelihood surface evaluated by workers.
pub trait Objective: Sync {
    fn evaluate(&self, ctx: &mut WorkerContext, point: &ParameterVector) -> ObjectiveResult;

    /// Serializable description for out-of-process workers, if any.
    fn definition(&self) -> Option<&ObjectiveDefinition> {
        None
    }
}

struct ExperimentModel {
    response: DetectorResponse,
    likelihood: ExperimentLikelihood,
    observations: Observations,
    site: Option<(Site, f64)>,
}

/// Rate and response pipeline for a set of experiments.
///
/// Shared by the objective and by benchmark data generation.
pub struct SignalPipeline {
    rate: RateModel,
    shielding: Arc<dyn ShieldingModel>,
    settings: ShieldingSettings,
}

impl SignalPipeline {
    pub fn new(rate: RateModel, shielding: Arc<dyn ShieldingModel>, settings: ShieldingSettings) -> Self {
        Self {
            rate,
            shielding,
            settings,
        }
    }

    pub fn standard(settings: ShieldingSettings) -> Self {
        Self::new(RateModel::standard(), Arc::new(settings.model()), settings)
    }

    /// Site and overburden when shielding applies to `config`.
    pub fn site_for(&self, config: &ExperimentConfig) -> ConfigResult<Option<(Site, f64)>> {
        if !self.settings.enabled {
            return Ok(None);
        }
        match &config.location {
            Some(location) => {
                let site = Site::lookup(location)?;
                let depth = config.depth_km.unwrap_or(site.depth_km);
                Ok(Some((site, depth)))
            }
            None => Ok(None),
        }
    }

    fn distribution(
        &self,
        cache: &mut ShieldingCache,
        site: Option<&(Site, f64)>,
        point: &DarkMatterPoint,
        free: &mut Option<Arc<VelocityDistribution>>,
    ) -> PhysicsResult<Arc<VelocityDistribution>> {
        match site {
            Some((site, depth)) => {
                cache.get_or_compute(site, *depth, &point.halo.velocity, self.shielding.as_ref())
            }
            None => {
                if let Some(found) = free {
                    return Ok(Arc::clone(found));
                }
                let computed = Arc::new(StandardHalo::distribution(
                    &point.halo.velocity,
                    self.settings.grid_points,
                )?);
                *free = Some(Arc::clone(&computed));
                Ok(computed)
            }
        }
    }

    /// Expected counts for one experiment at `point`.
    pub fn expected_counts(
        &self,
        cache: &mut ShieldingCache,
        response: &DetectorResponse,
        point: &DarkMatterPoint,
    ) -> ConfigResult<BinnedCounts> {
        let config = response.config();
        let site = self.site_for(config)?;
        let as_config_error = |err: PhysicsError| ConfigError::Experiment {
            experiment: config.name.clone(),
            message: err.to_string(),
        };
        let distribution = self
            .distribution(cache, site.as_ref(), point, &mut None)
            .map_err(as_config_error)?;
        let spectrum = self
            .rate
            .spectrum(point, &distribution, config)
            .map_err(as_config_error)?;
        response.expected_counts(&spectrum).map_err(as_config_error)
    }
}

/// Sum of per-experiment log-likelihoods plus nuisance constraints.
pub struct JointObjective {
    definition: ObjectiveDefinition,
    pipeline: SignalPipeline,
    experiments: Vec<ExperimentModel>,
}

impl JointObjective {
    pub fn from_definition(definition: ObjectiveDefinition) -> ConfigResult<Self> {
        let pipeline = SignalPipeline::standard(definition.shielding);
        Self::with_pipeline(definition, pipeline)
    }

    pub fn with_models(
        definition: ObjectiveDefinition,
        rate: RateModel,
        shielding: Arc<dyn ShieldingModel>,
    ) -> ConfigResult<Self> {
        let pipeline = SignalPipeline::new(rate, shielding, definition.shielding);
        Self::with_pipeline(definition, pipeline)
    }

    fn with_pipeline(definition: ObjectiveDefinition, pipeline: SignalPipeline) -> ConfigResult<Self> {
        definition.validate()?;
        let experiments = definition
            .experiments
            .iter()
            .map(|prepared| -> ConfigResult<ExperimentModel> {
                Ok(ExperimentModel {
                    response: DetectorResponse::new(&prepared.config),
                    likelihood: ExperimentLikelihood::new(prepared.config.name.clone(), definition.likelihood),
                    observations: prepared.observations.clone(),
                    site: pipeline.site_for(&prepared.config)?,
                })
            })
            .collect::<ConfigResult<Vec<_>>>()?;
        Ok(Self {
            definition,
            pipeline,
            experiments,
        })
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.definition.space
    }

    pub fn cache_tolerance(&self) -> f64 {
        self.definition.shielding.cache_tolerance
    }

    /// Per-experiment results for `point`.
    pub fn evaluate_detailed(
        &self,
        ctx: &mut WorkerContext,
        point: &ParameterVector,
    ) -> PhysicsResult<Vec<LikelihoodResult>> {
        let resolved = self.definition.resolve(point)?;
        self.likelihoods(ctx, &resolved)
    }

    fn likelihoods(
        &self,
        ctx: &mut WorkerContext,
        resolved: &DarkMatterPoint,
    ) -> PhysicsResult<Vec<LikelihoodResult>> {
        let mut free = None;
        self.experiments
            .iter()
            .map(|experiment| -> PhysicsResult<LikelihoodResult> {
                let distribution = self.pipeline.distribution(
                    &mut ctx.cache,
                    experiment.site.as_ref(),
                    resolved,
                    &mut free,
                )?;
                let spectrum = self
                    .pipeline
                    .rate
                    .spectrum(resolved, &distribution, experiment.response.config())?;
                let counts = experiment.response.expected_counts(&spectrum)?;
                Ok(experiment
                    .likelihood
                    .log_likelihood(&counts, &experiment.observations))
            })
            .collect()
    }

    fn constraint_log_prior(&self, point: &DarkMatterPoint) -> f64 {
        self.definition
            .constraints
            .iter()
            .map(|constraint| {
                let value = match constraint.parameter {
                    ParameterKind::LogMass => point.mass_gev.log10(),
                    ParameterKind::LogCrossSection => point.cross_section_cm2.log10(),
                    ParameterKind::V0 => point.halo.velocity.v_0,
                    ParameterKind::VEsc => point.halo.velocity.v_esc,
                    ParameterKind::Density => point.halo.density,
                };
                constraint.log_density(value)
            })
            .sum()
    }
}

impl Objective for JointObjective {
    fn evaluate(&self, ctx: &mut WorkerContext, point: &ParameterVector) -> ObjectiveResult {
        let resolved = match self.definition.resolve(point) {
            Ok(resolved) => resolved,
            Err(err) => return err.into(),
        };
        let results = match self.likelihoods(ctx, &resolved) {
            Ok(results) => results,
            Err(err) => return err.into(),
        };
        if results.iter().any(|r| r.degenerate) {
            return ObjectiveResult::Valid(self.definition.likelihood.degenerate_log_likelihood);
        }
        let total: f64 = results.iter().map(|r| r.log_likelihood).sum();
        ObjectiveResult::Valid(total + self.constraint_log_prior(&resolved))
    }

    fn definition(&self) -> Option<&ObjectiveDefinition> {
        Some(&self.definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{preset, Background};
    use crate::math::stats::StatsHelper;
    use crate::prelude::InvalidKind;
    use crate::statistics::priors::{FittedParameter, Prior};
    use approx::assert_relative_eq;

    fn benchmark() -> DarkMatterPoint {
        DarkMatterPoint {
            mass_gev: 50.0,
            cross_section_cm2: 1e-45,
            halo: Default::default(),
        }
    }

    fn mass_space() -> ParameterSpace {
        ParameterSpace::new(vec![
            FittedParameter {
                parameter: ParameterKind::LogMass,
                prior: Prior::Flat { low: -1.0, high: 4.0 },
                start: None,
            },
            FittedParameter {
                parameter: ParameterKind::LogCrossSection,
                prior: Prior::Flat {
                    low: -50.0,
                    high: -40.0,
                },
                start: None,
            },
        ])
        .unwrap()
    }

    fn definition_with(experiments: Vec<PreparedExperiment>) -> ObjectiveDefinition {
        ObjectiveDefinition {
            experiments,
            space: mass_space(),
            fixed: benchmark(),
            shielding: ShieldingSettings::default(),
            likelihood: LikelihoodSettings::default(),
            constraints: Vec::new(),
        }
    }

    fn xe_with(counts: Vec<f64>) -> PreparedExperiment {
        let mut config = preset("Xe_bg").unwrap();
        config.background = Background::Flat { rate: 1e-3 };
        PreparedExperiment {
            config,
            observations: Observations::Counts { counts },
        }
    }

    fn vector(log_mass: f64, log_cross_section: f64) -> ParameterVector {
        ParameterVector::from_values(
            &[ParameterKind::LogMass, ParameterKind::LogCrossSection],
            &[log_mass, log_cross_section],
        )
    }

    #[test]
    fn two_identical_experiments_double_the_value() {
        let data = vec![0.0, 2.0, 3.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0];
        let single = JointObjective::from_definition(definition_with(vec![xe_with(data.clone())])).unwrap();
        let double =
            JointObjective::from_definition(definition_with(vec![xe_with(data.clone()), xe_with(data)])).unwrap();
        let mut ctx = WorkerContext::new(0, 1e-3);
        let point = vector(1.7, -45.0);

        let one = single.evaluate(&mut ctx, &point).value_or(f64::NAN);
        let two = double.evaluate(&mut ctx, &point).value_or(f64::NAN);
        assert!(one.is_finite());
        assert_eq!(two, 2.0 * one);
    }

    #[test]
    fn light_mass_reduces_to_background_only_poisson() {
        let data = vec![0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let prepared = xe_with(data.clone());
        let background = DetectorResponse::new(&prepared.config).background_only();
        let objective = JointObjective::from_definition(definition_with(vec![prepared])).unwrap();
        let mut ctx = WorkerContext::new(0, 1e-3);

        let result = objective.evaluate(&mut ctx, &vector(0.0, -45.0));
        let expected: f64 = background
            .expected()
            .iter()
            .zip(&data)
            .map(|(&lambda, &n)| StatsHelper::poisson_log_pmf(n, lambda).unwrap())
            .sum();
        assert_relative_eq!(result.value_or(f64::NAN), expected, epsilon = 1e-9);
    }

    #[test]
    fn out_of_prior_point_is_invalid() {
        let objective = JointObjective::from_definition(definition_with(vec![xe_with(vec![0.0; 10])])).unwrap();
        let mut ctx = WorkerContext::new(0, 1e-3);
        match objective.evaluate(&mut ctx, &vector(7.0, -45.0)) {
            ObjectiveResult::Invalid(invalid) => {
                assert_eq!(invalid.kind, InvalidKind::PhysicallyInvalid)
            }
            other => panic!("expected invalid, got {:?}", other),
        }
    }

    #[test]
    fn degenerate_experiment_returns_floor() {
        let mut config = preset("Xe").unwrap();
        config.threshold_kev = 0.0;
        let prepared = PreparedExperiment {
            config,
            observations: Observations::Counts {
                counts: vec![5.0; 10],
            },
        };
        let objective = JointObjective::from_definition(definition_with(vec![prepared])).unwrap();
        let mut ctx = WorkerContext::new(0, 1e-3);
        // 0.1 GeV cannot produce recoils and there is no background
        let result = objective.evaluate(&mut ctx, &vector(-1.0, -45.0));
        assert_eq!(result, ObjectiveResult::Valid(-1e30));
    }

    #[test]
    fn empty_data_and_no_expected_events_contribute_nothing() {
        let silent = |name: &str| {
            let mut config = preset("Xe").unwrap();
            config.name = name.to_string();
            assert!(config.background.is_none());
            PreparedExperiment {
                config,
                observations: Observations::Counts {
                    counts: vec![0.0; 10],
                },
            }
        };
        let objective =
            JointObjective::from_definition(definition_with(vec![silent("a"), silent("b")])).unwrap();
        let mut ctx = WorkerContext::new(0, 1e-3);
        let result = objective.evaluate(&mut ctx, &vector(-1.0, -45.0));
        assert_eq!(result, ObjectiveResult::Valid(0.0));
    }

    #[test]
    fn detailed_breakdown_sums_to_the_joint_value() {
        let mut ge = xe_with(vec![0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        ge.config = preset("Ge_bg").unwrap();
        ge.config.background = Background::Flat { rate: 1e-3 };
        let xe = xe_with(vec![0.0, 2.0, 3.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0]);
        let objective = JointObjective::from_definition(definition_with(vec![xe, ge])).unwrap();
        let mut ctx = WorkerContext::new(0, 1e-3);
        let point = vector(1.7, -45.0);

        let detailed = objective.evaluate_detailed(&mut ctx, &point).unwrap();
        assert_eq!(detailed.len(), 2);
        assert_eq!(detailed[0].experiment, "Xe_bg");
        assert_eq!(detailed[1].experiment, "Ge_bg");
        assert!(detailed.iter().all(|r| !r.degenerate && r.log_likelihood.is_finite()));
        let sum: f64 = detailed.iter().map(|r| r.log_likelihood).sum();
        assert_relative_eq!(
            objective.evaluate(&mut ctx, &point).value_or(f64::NAN),
            sum,
            epsilon = 1e-12
        );
    }

    #[test]
    fn detailed_breakdown_reports_out_of_prior_points() {
        let objective = JointObjective::from_definition(definition_with(vec![xe_with(vec![0.0; 10])])).unwrap();
        let mut ctx = WorkerContext::new(0, 1e-3);
        assert!(matches!(
            objective.evaluate_detailed(&mut ctx, &vector(7.0, -45.0)),
            Err(PhysicsError::OutOfPrior { .. })
        ));
    }

    #[test]
    fn constraints_add_gaussian_log_prior() {
        let mut definition = definition_with(vec![xe_with(vec![0.0; 10])]);
        let bare = JointObjective::from_definition(definition.clone()).unwrap();
        definition.constraints.push(NuisanceConstraint {
            parameter: ParameterKind::Density,
            mean: 0.4,
            std: 0.1,
        });
        let constrained = JointObjective::from_definition(definition).unwrap();
        let mut ctx = WorkerContext::new(0, 1e-3);
        let point = vector(1.7, -45.0);
        let delta = constrained.evaluate(&mut ctx, &point).value_or(f64::NAN)
            - bare.evaluate(&mut ctx, &point).value_or(f64::NAN);
        let expected = -0.5 - (0.1 * (2.0 * std::f64::consts::PI).sqrt()).ln();
        assert_relative_eq!(delta, expected, epsilon = 1e-9);
    }

    #[test]
    fn shielded_experiments_use_the_worker_cache() {
        let mut definition = definition_with(vec![xe_with(vec![0.0; 10])]);
        definition.experiments[0].config.location = Some("XENON".into());
        definition.shielding.enabled = true;
        let objective = JointObjective::from_definition(definition).unwrap();
        let mut ctx = WorkerContext::new(3, 1e-3);
        objective.evaluate(&mut ctx, &vector(1.7, -45.0));
        objective.evaluate(&mut ctx, &vector(2.0, -44.0));
        let stats = ctx.cache.stats();
        assert_eq!((stats.misses, stats.hits), (1, 1));
    }

    #[test]
    fn mismatched_observations_fail_at_build_time() {
        let result = JointObjective::from_definition(definition_with(vec![xe_with(vec![0.0; 3])]));
        assert!(matches!(result, Err(ConfigError::Experiment { .. })));
    }
}
