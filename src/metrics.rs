//! Evaluation counters.
//!
//! Counters are plain relaxed atomics shared by every handler built from the
//! same context. Exporting them is left to the embedding service.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Shared evaluation counters.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    packets_evaluated: AtomicU64,
    skipped_duplicates: AtomicU64,
    invalid_configurations: AtomicU64,
    tainted_evaluations: AtomicU64,
    evidence_failures: AtomicU64,
    occurrences: AtomicU64,
    resolutions: AtomicU64,
    counter_resets: AtomicU64,
    emit_failures: AtomicU64,
}

macro_rules! incr {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("Increment `", stringify!($field), "`.")]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl EvaluationMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    incr! {
        record_packet => packets_evaluated,
        record_skipped_duplicate => skipped_duplicates,
        record_invalid_configuration => invalid_configurations,
        record_tainted => tainted_evaluations,
        record_evidence_failure => evidence_failures,
        record_occurrence => occurrences,
        record_resolution => resolutions,
        record_counter_reset => counter_resets,
        record_emit_failure => emit_failures,
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_evaluated: self.packets_evaluated.load(Ordering::Relaxed),
            skipped_duplicates: self.skipped_duplicates.load(Ordering::Relaxed),
            invalid_configurations: self.invalid_configurations.load(Ordering::Relaxed),
            tainted_evaluations: self.tainted_evaluations.load(Ordering::Relaxed),
            evidence_failures: self.evidence_failures.load(Ordering::Relaxed),
            occurrences: self.occurrences.load(Ordering::Relaxed),
            resolutions: self.resolutions.load(Ordering::Relaxed),
            counter_resets: self.counter_resets.load(Ordering::Relaxed),
            emit_failures: self.emit_failures.load(Ordering::Relaxed),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub packets_evaluated: u64,
    pub skipped_duplicates: u64,
    pub invalid_configurations: u64,
    pub tainted_evaluations: u64,
    pub evidence_failures: u64,
    pub occurrences: u64,
    pub resolutions: u64,
    pub counter_resets: u64,
    pub emit_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = EvaluationMetrics::new();
        metrics.record_packet();
        metrics.record_packet();
        metrics.record_skipped_duplicate();
        let snap = metrics.snapshot();
        assert_eq!(snap.packets_evaluated, 2);
        assert_eq!(snap.skipped_duplicates, 1);
        assert_eq!(snap.occurrences, 0);
    }
}
