pub mod config;
pub mod presets;
pub mod site;

pub use config::{Background, Binning, ExperimentConfig, ObservedData, Resolution, Target};
pub use presets::preset;
pub use site::Site;
