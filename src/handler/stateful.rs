//! Stateful detector handler.
//!
//! Drives one evaluation pass over a data packet:
//!
//! 1. extract the dedupe value and the per-group-key values
//! 2. bulk-load state for every group key
//! 3. per group key: drop stale packets, evaluate conditions, update the
//!    threshold counters, and stage a transition once a threshold is crossed
//! 4. commit all staged state in one pass
//!
//! Priority changes are hysteretic. A level is only entered after its
//! configured number of consecutive breaches; a breach at some level also
//! counts toward every lower non-OK level.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::condition::{process_condition_group, ProcessedConditionGroup, SlowConditionEvaluator};
use crate::data_source::{DataSourceLookup, InMemoryDataSourceLookup};
use crate::detector::{Detector, Thresholds};
use crate::error::{ConfigError, DetectorError, DetectorResult, EvaluationError};
use crate::metrics::EvaluationMetrics;
use crate::occurrence::{build_fingerprint, occurrence_id, IssueOccurrence, StatusChangeMessage};
use crate::packet::{DataPacket, GroupKey};
use crate::priority::PriorityLevel;
use crate::storage::{CounterStore, DetectorStateStore};

use super::behavior::{DetectorBehavior, EvidenceContext};
use super::manager::{CounterMap, DetectorStateData, DetectorStateManager, StateManagerConfig};
use super::result::{DetectorEvaluationResult, EvaluationOutcome, GroupedEvaluationResult};

/// Shared collaborators of every handler.
#[derive(Clone)]
pub struct HandlerContext {
    /// Ephemeral dedupe values and counters.
    pub counters: Arc<dyn CounterStore>,
    /// Durable `(is_triggered, status)` rows.
    pub states: Arc<dyn DetectorStateStore>,
    /// Evidence enrichment.
    pub data_sources: Arc<dyn DataSourceLookup>,
    /// Evaluator for slow conditions; `None` leaves them unevaluated.
    pub slow_conditions: Option<Arc<dyn SlowConditionEvaluator>>,
    /// Shared evaluation counters.
    pub metrics: Arc<EvaluationMetrics>,
    /// Counter expiry.
    pub state_config: StateManagerConfig,
}

impl HandlerContext {
    /// Context over the given stores with no data sources, no slow condition
    /// evaluator, fresh metrics and default configuration.
    #[must_use]
    pub fn new(counters: Arc<dyn CounterStore>, states: Arc<dyn DetectorStateStore>) -> Self {
        Self {
            counters,
            states,
            data_sources: Arc::new(InMemoryDataSourceLookup::new()),
            slow_conditions: None,
            metrics: Arc::new(EvaluationMetrics::new()),
            state_config: StateManagerConfig::default(),
        }
    }

    /// Replace the data source lookup.
    #[must_use]
    pub fn with_data_sources(mut self, data_sources: Arc<dyn DataSourceLookup>) -> Self {
        self.data_sources = data_sources;
        self
    }

    /// Evaluate slow conditions with `evaluator`.
    #[must_use]
    pub fn with_slow_conditions(mut self, evaluator: Arc<dyn SlowConditionEvaluator>) -> Self {
        self.slow_conditions = Some(evaluator);
        self
    }

    /// Record into `metrics` instead of a private instance.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<EvaluationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Override the state manager configuration.
    #[must_use]
    pub fn with_state_config(mut self, state_config: StateManagerConfig) -> Self {
        self.state_config = state_config;
        self
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("slow_conditions", &self.slow_conditions.is_some())
            .field("state_config", &self.state_config)
            .finish_non_exhaustive()
    }
}

/// Evaluates packets for one detector.
pub struct StatefulDetectorHandler {
    detector: Arc<Detector>,
    behavior: Arc<dyn DetectorBehavior>,
    thresholds: Option<Thresholds>,
    context: HandlerContext,
    state_manager: DetectorStateManager,
}

impl StatefulDetectorHandler {
    /// Build a handler for `detector`.
    ///
    /// Thresholds are resolved once. An unparseable threshold configuration
    /// is logged and leaves the detector misconfigured: every pass then skips
    /// its group keys.
    #[must_use]
    pub fn new(
        detector: Arc<Detector>,
        behavior: Arc<dyn DetectorBehavior>,
        context: HandlerContext,
    ) -> Self {
        let thresholds = match detector.effective_thresholds() {
            Ok(thresholds) => Some(thresholds),
            Err(e) => {
                warn!(detector_id = %detector.id, error = %e, "invalid detector thresholds");
                None
            }
        };
        let counter_names: Vec<PriorityLevel> = thresholds
            .as_ref()
            .map(|t| t.levels().collect())
            .unwrap_or_default();
        let state_manager = DetectorStateManager::new(
            detector.id,
            counter_names,
            context.state_config.clone(),
            Arc::clone(&context.counters),
            Arc::clone(&context.states),
        );
        Self {
            detector,
            behavior,
            thresholds,
            context,
            state_manager,
        }
    }

    /// The detector being evaluated.
    #[must_use]
    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    /// The state manager backing this handler.
    #[must_use]
    pub fn state_manager(&self) -> &DetectorStateManager {
        &self.state_manager
    }

    /// Evaluate one packet and commit the resulting state.
    ///
    /// Returns the transitions produced by this pass. Stale or duplicate
    /// packets produce none.
    ///
    /// # Errors
    /// Storage failures abort the whole pass and should be retried by the
    /// transport. A payload the detector kind cannot read is an
    /// `EvaluationError`.
    #[instrument(skip(self, packet), fields(detector_id = %self.detector.id, sequence = packet.sequence))]
    pub fn evaluate(&mut self, packet: &DataPacket) -> DetectorResult<GroupedEvaluationResult> {
        self.context.metrics.record_packet();

        let dedupe_value = self.behavior.extract_dedupe_value(packet);
        if i64::try_from(dedupe_value).is_err() {
            return Err(EvaluationError::ValueExtraction {
                reason: format!("dedupe value {dedupe_value} exceeds the counter store range"),
            }
            .into());
        }
        let values = self.behavior.extract_value(packet)?;
        let mut grouped = GroupedEvaluationResult::default();
        if values.is_empty() {
            return Ok(grouped);
        }

        let group_keys: Vec<GroupKey> = values.keys().cloned().collect();
        let states = self
            .state_manager
            .get_state_data(&group_keys)
            .map_err(|e| DetectorError::storage("get_state_data", e))?;

        for (group_key, value) in &values {
            let Some(state) = states.get(group_key) else {
                continue;
            };
            let mut tainted = false;
            if let Some(result) =
                self.evaluate_group_key(group_key, value, state, dedupe_value, packet, &mut tainted)
            {
                grouped.results.insert(group_key.clone(), result);
            }
            grouped.tainted |= tainted;
        }

        self.state_manager
            .commit_state_updates()
            .map_err(|e| DetectorError::storage("commit_state_updates", e))?;

        if grouped.tainted {
            self.context.metrics.record_tainted();
            warn!(
                detector_id = %self.detector.id,
                dedupe_value,
                "evaluation skipped slow conditions; result may be incomplete"
            );
        }
        Ok(grouped)
    }

    fn evaluate_group_key(
        &mut self,
        group_key: &GroupKey,
        value: &Value,
        state: &DetectorStateData,
        dedupe_value: u64,
        packet: &DataPacket,
        tainted: &mut bool,
    ) -> Option<DetectorEvaluationResult> {
        let metrics = Arc::clone(&self.context.metrics);

        if dedupe_value <= state.dedupe_value {
            metrics.record_skipped_duplicate();
            debug!(
                group_key = ?group_key,
                dedupe_value,
                last_dedupe_value = state.dedupe_value,
                "skipping already processed update"
            );
            return None;
        }
        self.state_manager.enqueue_dedupe_update(group_key.clone(), dedupe_value);

        let Some(condition_group) = self.detector.condition_group.as_ref() else {
            metrics.record_invalid_configuration();
            let err = ConfigError::MissingConditionGroup {
                detector_id: self.detector.id,
            };
            warn!(group_key = ?group_key, error = %err, "skipping evaluation of misconfigured detector");
            return None;
        };
        let Some(thresholds) = self.thresholds.clone() else {
            metrics.record_invalid_configuration();
            warn!(group_key = ?group_key, "skipping evaluation of detector with invalid thresholds");
            return None;
        };

        let processed =
            process_condition_group(condition_group, value, self.context.slow_conditions.as_deref());
        *tainted = processed.logic_result.tainted;
        let evaluated = processed.evaluated_priority;

        if evaluated == state.status {
            // No new information. Drop partial counts toward a level we
            // never reached so they cannot combine with later breaches.
            if state.has_partial_counts() {
                metrics.record_counter_reset();
                self.state_manager.enqueue_counter_reset(group_key.clone());
            }
            return None;
        }

        let counts = increment_thresholds(state, evaluated, &thresholds);
        self.state_manager
            .enqueue_counter_update(group_key.clone(), counts.clone());

        let new_level = thresholds.most_severe_first().find_map(|(level, required)| {
            let count = counts.get(&level).copied().flatten().unwrap_or(0);
            (u64::try_from(count).unwrap_or(0) >= required).then_some(level)
        })?;
        if new_level == state.status {
            return None;
        }

        let result = match self.build_result(group_key, value, &processed, new_level, dedupe_value, packet) {
            Ok(result) => result,
            Err(e) => {
                metrics.record_evidence_failure();
                error!(
                    detector_id = %self.detector.id,
                    group_key = ?group_key,
                    error = %e,
                    "failed to build evaluation result"
                );
                return None;
            }
        };

        self.state_manager
            .enqueue_state_update(group_key.clone(), new_level.is_triggered(), new_level);
        if new_level == PriorityLevel::Ok {
            metrics.record_resolution();
            self.state_manager.enqueue_counter_reset(group_key.clone());
        } else {
            metrics.record_occurrence();
        }
        debug!(
            group_key = ?group_key,
            from = %state.status,
            to = %new_level,
            "detector state transition"
        );
        Some(result)
    }

    fn build_result(
        &self,
        group_key: &GroupKey,
        value: &Value,
        processed: &ProcessedConditionGroup,
        new_level: PriorityLevel,
        dedupe_value: u64,
        packet: &DataPacket,
    ) -> Result<DetectorEvaluationResult, EvaluationError> {
        let detector = &*self.detector;
        let fingerprint = build_fingerprint(
            detector.id,
            group_key,
            self.behavior.build_fingerprint_extra(detector, group_key),
        );

        if new_level == PriorityLevel::Ok {
            return Ok(DetectorEvaluationResult {
                group_key: group_key.clone(),
                is_triggered: false,
                priority: PriorityLevel::Ok,
                outcome: EvaluationOutcome::Resolution(StatusChangeMessage::resolved(
                    fingerprint,
                    detector.project_id,
                )),
                event_data: None,
            });
        }

        let evidence_err = |reason: String| EvaluationError::Evidence {
            group_key: group_key.clone(),
            reason,
        };

        let data_sources = self
            .context
            .data_sources
            .find(detector.id, &packet.source_id)
            .map_err(|e| evidence_err(format!("data source lookup failed: {e}")))?;

        let ctx = EvidenceContext {
            detector,
            group_key,
            value,
            processed,
            priority: new_level,
            packet,
            data_sources: &data_sources,
        };
        let evidence = self.behavior.build_evidence(&ctx)?;

        let conditions: Vec<_> = processed.passed().collect();
        let mut evidence_data = serde_json::Map::new();
        evidence_data.insert("detector_id".to_string(), json!(detector.id));
        evidence_data.insert("value".to_string(), value.clone());
        evidence_data.insert("data_packet_source_id".to_string(), json!(packet.source_id));
        evidence_data.insert(
            "conditions".to_string(),
            serde_json::to_value(&conditions).map_err(|e| evidence_err(e.to_string()))?,
        );
        evidence_data.insert(
            "data_sources".to_string(),
            serde_json::to_value(&data_sources).map_err(|e| evidence_err(e.to_string()))?,
        );
        evidence_data.extend(evidence.evidence_data);

        let id = occurrence_id(detector.id, group_key, dedupe_value);
        let occurrence = IssueOccurrence {
            id,
            event_id: Uuid::new_v5(&id, b"event"),
            project_id: detector.project_id,
            fingerprint,
            issue_title: evidence.issue_title,
            subtitle: evidence.subtitle,
            priority: new_level,
            evidence_data,
            evidence_display: evidence.evidence_display,
            detection_time: Utc::now(),
        };
        let event_data = json!({
            "event_id": occurrence.event_id,
            "project_id": detector.project_id,
            "timestamp": occurrence.detection_time,
            "dedupe_value": dedupe_value,
        });

        Ok(DetectorEvaluationResult {
            group_key: group_key.clone(),
            is_triggered: true,
            priority: new_level,
            outcome: EvaluationOutcome::Occurrence(Box::new(occurrence)),
            event_data: Some(event_data),
        })
    }
}

/// Counter values after a breach evaluated at `evaluated`.
///
/// An `Ok` evaluation counts toward `Ok` only. A triggered evaluation counts
/// toward every configured non-OK level at or below it. All other counters
/// are cleared, keeping counts consecutive.
fn increment_thresholds(
    state: &DetectorStateData,
    evaluated: PriorityLevel,
    thresholds: &Thresholds,
) -> CounterMap {
    thresholds
        .levels()
        .map(|level| {
            let counts = if evaluated == PriorityLevel::Ok {
                level == PriorityLevel::Ok
            } else {
                level > PriorityLevel::Ok && level <= evaluated
            };
            let next = counts.then(|| state.count(level) + 1);
            (level, next)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn state(status: PriorityLevel, counters: &[(PriorityLevel, Option<i64>)]) -> DetectorStateData {
        DetectorStateData {
            group_key: None,
            is_triggered: status.is_triggered(),
            status,
            dedupe_value: 0,
            counter_updates: counters.iter().copied().collect(),
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds::new(BTreeMap::from([
            (PriorityLevel::Low, 3),
            (PriorityLevel::Medium, 2),
            (PriorityLevel::High, 2),
        ]))
        .unwrap()
    }

    #[test]
    fn high_breach_counts_toward_lower_levels() {
        let s = state(PriorityLevel::Ok, &[(PriorityLevel::Medium, Some(1))]);
        let counts = increment_thresholds(&s, PriorityLevel::High, &thresholds());
        assert_eq!(counts[&PriorityLevel::Low], Some(1));
        assert_eq!(counts[&PriorityLevel::Medium], Some(2));
        assert_eq!(counts[&PriorityLevel::High], Some(1));
        assert_eq!(counts[&PriorityLevel::Ok], None);
    }

    #[test]
    fn lower_breach_clears_higher_counters() {
        let s = state(
            PriorityLevel::Ok,
            &[(PriorityLevel::High, Some(1)), (PriorityLevel::Ok, Some(2))],
        );
        let counts = increment_thresholds(&s, PriorityLevel::Medium, &thresholds());
        assert_eq!(counts[&PriorityLevel::Medium], Some(1));
        assert_eq!(counts[&PriorityLevel::High], None);
        assert_eq!(counts[&PriorityLevel::Ok], None);
    }

    #[test]
    fn ok_evaluation_counts_only_ok() {
        let s = state(
            PriorityLevel::High,
            &[(PriorityLevel::High, Some(2)), (PriorityLevel::Ok, Some(1))],
        );
        let counts = increment_thresholds(&s, PriorityLevel::Ok, &thresholds());
        assert_eq!(counts[&PriorityLevel::Ok], Some(2));
        assert_eq!(counts[&PriorityLevel::High], None);
        assert_eq!(counts[&PriorityLevel::Low], None);
    }

    #[test]
    fn unconfigured_levels_are_not_tracked() {
        let t = Thresholds::immediate(&[PriorityLevel::High]);
        let counts = increment_thresholds(&state(PriorityLevel::Ok, &[]), PriorityLevel::High, &t);
        assert_eq!(counts.len(), 2);
        assert!(!counts.contains_key(&PriorityLevel::Medium));
    }
}
