pub mod integrate;
pub mod matrix;
pub mod stats;

pub use integrate::IntegrationHelper;
pub use matrix::MatrixHelper;
pub use stats::StatsHelper;
