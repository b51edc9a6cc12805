pub mod halo;
pub mod rate;
pub mod shielding;

pub use halo::{DarkMatterPoint, HaloParameters, StandardHalo, VelocityDistribution, VelocityParameters};
pub use rate::{RateModel, RateSimulator, RateSpectrum, StandardRate};
pub use shielding::{ContinuousSlowdown, ShieldingCache, ShieldingModel};
