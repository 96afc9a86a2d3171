//! Packet processing entry point.
//!
//! Resolves a detector and its kind, runs one evaluation pass and hands every
//! transition to the emitter. A handler is built per packet; all state lives
//! in the stores, so any number of packets may be processed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, error};

use crate::detector::{Detector, DetectorId};
use crate::error::{ConfigError, DetectorResult};
use crate::handler::{
    DetectorKindRegistry, EvaluationOutcome, GroupedEvaluationResult, HandlerContext,
    StatefulDetectorHandler,
};
use crate::metrics::EvaluationMetrics;
use crate::occurrence::OccurrenceEmitter;
use crate::packet::DataPacket;
use crate::storage::StorageError;

/// Read access to configured detectors.
pub trait DetectorCatalog: Send + Sync {
    /// Detector with `detector_id`, if configured.
    fn get(&self, detector_id: DetectorId) -> Result<Option<Arc<Detector>>, StorageError>;
}

/// Thread-safe in-memory catalog.
#[derive(Debug, Default)]
pub struct InMemoryDetectorCatalog {
    detectors: RwLock<HashMap<DetectorId, Arc<Detector>>>,
}

impl InMemoryDetectorCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a detector.
    pub fn upsert(&self, detector: Detector) -> Result<(), StorageError> {
        let mut detectors = self
            .detectors
            .write()
            .map_err(|_| StorageError::BackendError("poisoned lock: catalog.upsert".to_string()))?;
        detectors.insert(detector.id, Arc::new(detector));
        Ok(())
    }

    /// Remove a detector. Returns whether it existed.
    pub fn remove(&self, detector_id: DetectorId) -> Result<bool, StorageError> {
        let mut detectors = self
            .detectors
            .write()
            .map_err(|_| StorageError::BackendError("poisoned lock: catalog.remove".to_string()))?;
        Ok(detectors.remove(&detector_id).is_some())
    }
}

impl DetectorCatalog for InMemoryDetectorCatalog {
    fn get(&self, detector_id: DetectorId) -> Result<Option<Arc<Detector>>, StorageError> {
        let detectors = self
            .detectors
            .read()
            .map_err(|_| StorageError::BackendError("poisoned lock: catalog.get".to_string()))?;
        Ok(detectors.get(&detector_id).cloned())
    }
}

/// Evaluates packets and emits the resulting transitions.
pub struct DetectorProcessor {
    catalog: Arc<dyn DetectorCatalog>,
    registry: Arc<DetectorKindRegistry>,
    context: HandlerContext,
    emitter: Arc<dyn OccurrenceEmitter>,
}

impl DetectorProcessor {
    #[must_use]
    pub fn new(
        catalog: Arc<dyn DetectorCatalog>,
        registry: Arc<DetectorKindRegistry>,
        context: HandlerContext,
        emitter: Arc<dyn OccurrenceEmitter>,
    ) -> Self {
        Self {
            catalog,
            registry,
            context,
            emitter,
        }
    }

    /// Counters shared by every evaluation of this processor.
    #[must_use]
    pub fn metrics(&self) -> &EvaluationMetrics {
        &self.context.metrics
    }

    /// Evaluate `packet` for `detector_id` and emit its transitions.
    ///
    /// State is committed before anything is emitted. Emission failures are
    /// logged and counted; the committed state is not rolled back and the
    /// results are still returned.
    ///
    /// # Errors
    /// `DetectorNotFound`/`UnknownDetectorKind` for unresolvable detectors,
    /// plus anything `StatefulDetectorHandler::evaluate` returns.
    pub fn process_data_packet(
        &self,
        detector_id: DetectorId,
        packet: &DataPacket,
    ) -> DetectorResult<GroupedEvaluationResult> {
        let detector = self
            .catalog
            .get(detector_id)
            .map_err(|e| crate::error::DetectorError::storage("catalog.get", e))?
            .ok_or(ConfigError::DetectorNotFound { detector_id })?;
        let behavior = self.registry.get(&detector.kind)?;

        let mut handler = StatefulDetectorHandler::new(detector, behavior, self.context.clone());
        let results = handler.evaluate(packet)?;
        self.emit(detector_id, &results);
        Ok(results)
    }

    fn emit(&self, detector_id: DetectorId, results: &GroupedEvaluationResult) {
        let mut ordered: Vec<_> = results.results.values().collect();
        ordered.sort_by(|a, b| a.group_key.cmp(&b.group_key));

        for result in ordered {
            let sent = match &result.outcome {
                EvaluationOutcome::Occurrence(occurrence) => self
                    .emitter
                    .emit_occurrence(occurrence, result.event_data.as_ref()),
                EvaluationOutcome::Resolution(message) => self.emitter.emit_status_change(message),
            };
            match sent {
                Ok(()) => debug!(
                    detector_id = %detector_id,
                    group_key = ?result.group_key,
                    priority = %result.priority,
                    "emitted detector transition"
                ),
                Err(e) => {
                    self.context.metrics.record_emit_failure();
                    error!(
                        detector_id = %detector_id,
                        group_key = ?result.group_key,
                        error = %e,
                        "failed to emit detector transition"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for DetectorProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorProcessor")
            .field("registry", &self.registry)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
