use crate::prelude::{InvalidKind, ParameterVector};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// A failed evaluation kept for post-hoc inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub point: ParameterVector,
    pub kind: InvalidKind,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub evaluated: usize,
    pub invalid: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub batches: usize,
}

impl MetricsSnapshot {
    /// Worker failures and timeouts. Physically invalid points do not count.
    pub fn unhealthy(&self) -> usize {
        self.failed + self.timed_out
    }
}

/// Counters shared by every batch of a run.
pub struct EvaluationMetrics {
    inner: Mutex<Metrics>,
}

#[derive(Default)]
struct Metrics {
    counts: MetricsSnapshot,
    failures: Vec<FailureRecord>,
}

impl EvaluationMetrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Metrics::default()),
        }
    }

    pub fn record_batch(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.counts.batches += 1;
        }
    }

    pub fn record_valid(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.counts.evaluated += 1;
        }
    }

    pub fn record_invalid(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.counts.evaluated += 1;
            metrics.counts.invalid += 1;
        }
    }

    pub fn record_failure(&self, point: &ParameterVector, kind: InvalidKind, reason: &str) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.counts.evaluated += 1;
            metrics.counts.invalid += 1;
            match kind {
                InvalidKind::TimedOut => metrics.counts.timed_out += 1,
                _ => metrics.counts.failed += 1,
            }
            metrics.failures.push(FailureRecord {
                point: point.clone(),
                kind,
                reason: reason.to_string(),
            });
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        if let Ok(metrics) = self.inner.lock() {
            metrics.counts
        } else {
            MetricsSnapshot::default()
        }
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        if let Ok(metrics) = self.inner.lock() {
            metrics.failures.clone()
        } else {
            Vec::new()
        }
    }
}

impl Default for EvaluationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
