pub mod response;

pub use response::{BinnedCounts, DetectorResponse};
