//! Stateful detector evaluation.
//!
//! - `stateful`: the per-detector state machine
//! - `manager`: batched state reads and two-phase commits
//! - `behavior`/`kinds`: what varies between detector kinds
//! - `result`: per group key transitions

mod behavior;
mod kinds;
mod manager;
mod result;
mod stateful;

pub use behavior::{DetectorBehavior, DetectorKindRegistry, Evidence, EvidenceContext, GroupedValues};
pub use kinds::{GroupedValuesBehavior, MetricThresholdBehavior};
pub use manager::{
    CommitSummary, CounterMap, DetectorStateData, DetectorStateManager, StateManagerConfig,
    DEDUPE_SUFFIX, DEFAULT_COUNTER_TTL_SECONDS,
};
pub use result::{DetectorEvaluationResult, EvaluationOutcome, GroupedEvaluationResult};
pub use stateful::{HandlerContext, StatefulDetectorHandler};
