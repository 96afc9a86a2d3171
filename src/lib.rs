//! # Stateful detector evaluation engine
//!
//! Evaluates streaming data packets against configured detectors and decides,
//! per detector and per group key, when an issue should be opened, escalated
//! or resolved.
//!
//! ## Core Concepts
//!
//! - **Detector**: a condition group plus per-priority thresholds
//! - **Group key**: an independent sub-stream of one detector
//! - **Thresholds**: consecutive breaches required before a priority is
//!   entered, so transient spikes do not flap issues open and closed
//! - **Dedupe value**: packets at or below the last processed value for a
//!   group key are dropped
//!
//! State is split between an ephemeral counter store (dedupe values and
//! threshold counters, with a TTL) and a durable store holding the last known
//! status per group key.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stateful_detector::{
//!     ConditionType, DataCondition, DataConditionGroup, DataPacket, Detector, DetectorId,
//!     HandlerContext, InMemoryStores, MetricThresholdBehavior, ProjectId, StatefulDetectorHandler,
//! };
//!
//! let stores = InMemoryStores::default();
//! let ctx = HandlerContext::new(Arc::new(stores.counters), Arc::new(stores.states));
//! let detector = Detector::new(DetectorId(1), ProjectId(1), "p95 latency", "metric_threshold")
//!     .with_condition_group(DataConditionGroup::any(vec![
//!         DataCondition::new(1, ConditionType::Gt, serde_json::json!(500), serde_json::json!("high")),
//!     ]));
//!
//! let mut handler =
//!     StatefulDetectorHandler::new(Arc::new(detector), Arc::new(MetricThresholdBehavior), ctx);
//! let result = handler.evaluate(&DataPacket::new("sub-1", 1, serde_json::json!({"value": 900})))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod condition;
pub mod data_source;
pub mod detector;
pub mod error;
pub mod occurrence;
pub mod packet;
pub mod priority;

// State and evaluation
pub mod handler;
pub mod metrics;
pub mod storage;

// Entry points
pub mod processor;
pub mod runtime;

pub use condition::{
    process_condition_group, ConditionError, ConditionId, ConditionResult, ConditionType,
    DataCondition, DataConditionGroup, LogicResult, LogicType, ProcessedConditionGroup,
    SlowConditionEvaluator,
};
pub use data_source::{DataSource, DataSourceLookup, InMemoryDataSourceLookup};
pub use detector::{Detector, DetectorId, ProjectId, Thresholds};
pub use error::{ConfigError, DetectorError, DetectorResult, EvaluationError};
pub use handler::{
    DetectorBehavior, DetectorEvaluationResult, DetectorKindRegistry, DetectorStateData,
    DetectorStateManager, EvaluationOutcome, GroupedEvaluationResult, GroupedValuesBehavior,
    HandlerContext, MetricThresholdBehavior, StateManagerConfig, StatefulDetectorHandler,
};
pub use metrics::{EvaluationMetrics, MetricsSnapshot};
pub use occurrence::{
    CollectingEmitter, EmitError, GroupStatus, IssueEvidence, IssueOccurrence, OccurrenceEmitter,
    StatusChangeMessage,
};
pub use packet::{DataPacket, GroupKey};
pub use priority::PriorityLevel;
pub use processor::{DetectorCatalog, DetectorProcessor, InMemoryDetectorCatalog};
pub use runtime::{DetectorRuntime, EvaluationHandle, RuntimeConfig};
pub use storage::{
    CounterStore, CounterWrite, DetectorStateRow, DetectorStateStore, InMemoryCounterStore,
    InMemoryDetectorStateStore, InMemoryStores, StorageError,
};
