use crate::experiment::Site;
use crate::physics::halo::{StandardHalo, VelocityDistribution, VelocityParameters};
use crate::prelude::{PhysicsError, PhysicsResult};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Produces the velocity distribution that survives the overburden above a
/// detector.
pub trait ShieldingModel: Send + Sync {
    /// Distinguishes models (and their settings) inside a shared cache. Two
    /// models with equal fingerprints must produce the same distributions.
    fn fingerprint(&self) -> String;

    fn attenuate(
        &self,
        site: &Site,
        depth_km: f64,
        velocity: &VelocityParameters,
    ) -> PhysicsResult<VelocityDistribution>;
}

/// Continuous slowing-down through the rock column: every speed is reduced by
/// `exp(-column / attenuation_kmwe)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousSlowdown {
    pub attenuation_kmwe: f64,
    pub grid_points: usize,
}

impl Default for ContinuousSlowdown {
    fn default() -> Self {
        Self {
            attenuation_kmwe: 10.0,
            grid_points: StandardHalo::DEFAULT_GRID_POINTS,
        }
    }
}

impl ShieldingModel for ContinuousSlowdown {
    fn fingerprint(&self) -> String {
        format!(
            "continuous_slowdown/{}/{}",
            self.attenuation_kmwe, self.grid_points
        )
    }

    fn attenuate(
        &self,
        site: &Site,
        depth_km: f64,
        velocity: &VelocityParameters,
    ) -> PhysicsResult<VelocityDistribution> {
        if !(self.attenuation_kmwe > 0.0) {
            return Err(PhysicsError::Shielding(format!(
                "attenuation length must be positive, got {}",
                self.attenuation_kmwe
            )));
        }
        let free = StandardHalo::distribution(velocity, self.grid_points)?;
        let column = site.column_kmwe(depth_km);
        free.rescaled((-column / self.attenuation_kmwe).exp())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    model: String,
    site: String,
    depth: i64,
    v_0: i64,
    v_esc: i64,
    v_earth: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Worker-local memo of shielded velocity distributions.
///
/// Keys compare by value after rounding depth and velocity parameters to
/// `tolerance`, and include the model fingerprint. Entries live for the lifetime of the cache.
#[derive(Debug)]
pub struct ShieldingCache {
    tolerance: f64,
    entries: HashMap<CacheKey, Arc<VelocityDistribution>>,
    hits: u64,
    misses: u64,
}

impl ShieldingCache {
    pub const DEFAULT_TOLERANCE: f64 = 1e-3;

    pub fn new(tolerance: f64) -> Self {
        let tolerance = if tolerance > 0.0 {
            tolerance
        } else {
            Self::DEFAULT_TOLERANCE
        };
        Self {
            tolerance,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    fn quantize(&self, value: f64) -> i64 {
        (value / self.tolerance).round() as i64
    }

    pub fn get_or_compute(
        &mut self,
        site: &Site,
        depth_km: f64,
        velocity: &VelocityParameters,
        model: &dyn ShieldingModel,
    ) -> PhysicsResult<Arc<VelocityDistribution>> {
        let key = CacheKey {
            model: model.fingerprint(),
            site: site.name.clone(),
            depth: self.quantize(depth_km),
            v_0: self.quantize(velocity.v_0),
            v_esc: self.quantize(velocity.v_esc),
            v_earth: self.quantize(velocity.v_earth),
        };

        if let Some(found) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(Arc::clone(found));
        }

        self.misses += 1;
        debug!(
            "shielding cache miss for {} at {:.4} km (v_0={}, v_esc={})",
            site.name, depth_km, velocity.v_0, velocity.v_esc
        );
        let computed = Arc::new(model.attenuate(site, depth_km, velocity)?);
        self.entries.insert(key, Arc::clone(&computed));
        Ok(computed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ShieldingCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TOLERANCE)
    }
}
