use crate::prelude::ParameterVector;
use log::{info, warn};

/// Run-level log sink for the evaluator and samplers.
pub struct LogManager {
    component: &'static str,
}

impl LogManager {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }

    pub fn record(&self, message: &str) {
        info!("[{}] {}", self.component, message);
    }

    /// Failed or timed-out evaluation of `point`.
    pub fn record_failure(&self, index: usize, point: &ParameterVector, reason: &str) {
        let values: Vec<String> = point
            .iter()
            .map(|(kind, value)| format!("{}={:.6}", kind, value))
            .collect();
        warn!(
            "[{}] evaluation {} failed ({}): {}",
            self.component,
            index,
            values.join(", "),
            reason
        );
    }
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new("dmcore")
    }
}
