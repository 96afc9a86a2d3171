//! Condition group evaluation.
//!
//! Evaluation is pure: no I/O beyond the optional slow evaluator, no mutation.
//! Fast conditions run first. When their results already decide the group's
//! logic, slow conditions are skipped and reported in `skipped_slow`.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::priority::PriorityLevel;

use super::data_condition::{ConditionId, DataCondition, SlowConditionEvaluator};

/// How condition results combine into the group result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicType {
    /// Any satisfied condition triggers the group.
    #[default]
    Any,
    /// Every condition must be satisfied.
    All,
    /// No condition may be satisfied.
    None,
}

/// Ordered set of conditions evaluated together.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataConditionGroup {
    #[serde(default)]
    pub logic_type: LogicType,
    #[serde(default)]
    pub conditions: Vec<DataCondition>,
}

impl DataConditionGroup {
    #[must_use]
    pub fn new(logic_type: LogicType, conditions: Vec<DataCondition>) -> Self {
        Self {
            logic_type,
            conditions,
        }
    }

    /// An `any` group over `conditions`.
    #[must_use]
    pub fn any(conditions: Vec<DataCondition>) -> Self {
        Self::new(LogicType::Any, conditions)
    }
}

/// Outcome of one evaluated condition.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionResult {
    pub condition_id: ConditionId,
    pub passed: bool,
    /// Configured result, present only when the condition passed.
    pub result: Option<serde_json::Value>,
    /// `result` interpreted as a priority, when it is one.
    pub priority: Option<PriorityLevel>,
}

/// Aggregated group outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogicResult {
    /// Whether the group's logic is satisfied.
    pub triggered: bool,
    /// A slow condition that could have changed the outcome went unevaluated.
    pub tainted: bool,
}

/// Transient result of evaluating a value against a condition group.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessedConditionGroup {
    /// Evaluated conditions, in configured order.
    pub condition_results: Vec<ConditionResult>,
    pub logic_result: LogicResult,
    /// `Ok` when not triggered, else the max priority among passed conditions.
    pub evaluated_priority: PriorityLevel,
    /// Slow conditions left unevaluated.
    pub skipped_slow: Vec<ConditionId>,
}

impl ProcessedConditionGroup {
    /// Passed conditions, in configured order.
    pub fn passed(&self) -> impl Iterator<Item = &ConditionResult> {
        self.condition_results.iter().filter(|r| r.passed)
    }
}

/// Evaluate `value` against `group`.
///
/// Malformed conditions are logged and count as not passed. A slow condition
/// that is reached but cannot be evaluated (no evaluator, or the evaluator
/// fails) is reported in `skipped_slow` and taints the result.
pub fn process_condition_group(
    group: &DataConditionGroup,
    value: &serde_json::Value,
    slow: Option<&dyn SlowConditionEvaluator>,
) -> ProcessedConditionGroup {
    if group.conditions.is_empty() {
        return ProcessedConditionGroup::default();
    }

    let mut evaluated: Vec<(usize, ConditionResult)> = Vec::with_capacity(group.conditions.len());
    for (idx, condition) in group.conditions.iter().enumerate() {
        if condition.is_slow() {
            continue;
        }
        let passed = match condition.evaluate_fast(value) {
            Ok(passed) => passed,
            Err(e) => {
                warn!(condition_id = %condition.id, error = %e, "malformed condition, treating as not passed");
                false
            }
        };
        evaluated.push((idx, condition_result(condition, passed)));
    }

    let slow_conditions: Vec<(usize, &DataCondition)> = group
        .conditions
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_slow())
        .collect();

    let fast_passed = evaluated.iter().any(|(_, r)| r.passed);
    let fast_failed = evaluated.iter().any(|(_, r)| !r.passed);
    let decided = match group.logic_type {
        LogicType::Any => fast_passed,
        LogicType::All => fast_failed,
        LogicType::None => fast_passed,
    };

    let mut skipped_slow = Vec::new();
    let mut tainted = false;
    if decided {
        skipped_slow.extend(slow_conditions.iter().map(|(_, c)| c.id));
        // A skipped slow condition can still raise the max priority of a
        // triggered `any` group. Negative `all`/`none` outcomes are final.
        tainted = group.logic_type == LogicType::Any && !skipped_slow.is_empty();
    } else {
        for (idx, condition) in slow_conditions {
            let outcome = match slow {
                Some(evaluator) => evaluator.evaluate(condition, value),
                None => Err(super::ConditionError::Unavailable {
                    condition_id: condition.id,
                    reason: "no slow condition evaluator configured".to_string(),
                }),
            };
            match outcome {
                Ok(passed) => evaluated.push((idx, condition_result(condition, passed))),
                Err(e) => {
                    warn!(condition_id = %condition.id, error = %e, "slow condition left unevaluated");
                    skipped_slow.push(condition.id);
                    tainted = true;
                }
            }
        }
    }

    evaluated.sort_by_key(|(idx, _)| *idx);
    let condition_results: Vec<ConditionResult> = evaluated.into_iter().map(|(_, r)| r).collect();

    let passed_count = condition_results.iter().filter(|r| r.passed).count();
    let complete = skipped_slow.is_empty();
    let triggered = match group.logic_type {
        LogicType::Any => passed_count > 0,
        LogicType::All => complete && passed_count == condition_results.len(),
        LogicType::None => complete && passed_count == 0,
    };

    let evaluated_priority = if triggered {
        condition_results
            .iter()
            .filter(|r| r.passed)
            .filter_map(|r| r.priority)
            .max()
            .unwrap_or(PriorityLevel::Ok)
    } else {
        PriorityLevel::Ok
    };

    ProcessedConditionGroup {
        condition_results,
        logic_result: LogicResult { triggered, tainted },
        evaluated_priority,
        skipped_slow,
    }
}

fn condition_result(condition: &DataCondition, passed: bool) -> ConditionResult {
    if passed {
        ConditionResult {
            condition_id: condition.id,
            passed,
            result: Some(condition.condition_result.clone()),
            priority: PriorityLevel::from_condition_result(&condition.condition_result),
        }
    } else {
        ConditionResult {
            condition_id: condition.id,
            passed,
            result: None,
            priority: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{ConditionError, ConditionType};
    use serde_json::json;

    struct FixedSlow(Result<bool, ConditionError>);

    impl SlowConditionEvaluator for FixedSlow {
        fn evaluate(
            &self,
            _condition: &DataCondition,
            _value: &serde_json::Value,
        ) -> Result<bool, ConditionError> {
            self.0.clone()
        }
    }

    fn gt(id: u64, threshold: i64, result: serde_json::Value) -> DataCondition {
        DataCondition::new(id, ConditionType::Gt, json!(threshold), result)
    }

    fn anomaly(id: u64, result: serde_json::Value) -> DataCondition {
        DataCondition::new(id, ConditionType::AnomalyDetection, json!({}), result)
    }

    #[test]
    fn empty_group_is_not_triggered() {
        let out = process_condition_group(&DataConditionGroup::default(), &json!(10), None);
        assert!(!out.logic_result.triggered);
        assert!(!out.logic_result.tainted);
        assert_eq!(out.evaluated_priority, PriorityLevel::Ok);
    }

    #[test]
    fn any_selects_max_priority() {
        let group = DataConditionGroup::any(vec![gt(1, 5, json!(50)), gt(2, 8, json!(75))]);
        let out = process_condition_group(&group, &json!(10), None);
        assert!(out.logic_result.triggered);
        assert_eq!(out.evaluated_priority, PriorityLevel::High);
        assert_eq!(out.passed().count(), 2);
    }

    #[test]
    fn invalid_condition_result_is_ignored_for_priority() {
        let group = DataConditionGroup::any(vec![gt(1, 5, json!("bogus")), gt(2, 5, json!(25))]);
        let out = process_condition_group(&group, &json!(10), None);
        assert!(out.logic_result.triggered);
        assert_eq!(out.evaluated_priority, PriorityLevel::Low);
    }

    #[test]
    fn malformed_condition_does_not_abort() {
        let bad = DataCondition::new(1, ConditionType::Gt, json!("x"), json!(75));
        let group = DataConditionGroup::any(vec![bad, gt(2, 5, json!(50))]);
        let out = process_condition_group(&group, &json!(10), None);
        assert!(out.logic_result.triggered);
        assert_eq!(out.evaluated_priority, PriorityLevel::Medium);
        assert!(!out.condition_results[0].passed);
    }

    #[test]
    fn fast_any_skips_slow_and_taints() {
        let group = DataConditionGroup::any(vec![anomaly(1, json!(75)), gt(2, 5, json!(50))]);
        let slow = FixedSlow(Ok(true));
        let out = process_condition_group(&group, &json!(10), Some(&slow));
        assert!(out.logic_result.triggered);
        assert!(out.logic_result.tainted);
        assert_eq!(out.skipped_slow, vec![ConditionId(1)]);
        assert_eq!(out.evaluated_priority, PriorityLevel::Medium);
    }

    #[test]
    fn slow_condition_runs_when_fast_undecided() {
        let group = DataConditionGroup::any(vec![gt(1, 50, json!(50)), anomaly(2, json!(75))]);
        let slow = FixedSlow(Ok(true));
        let out = process_condition_group(&group, &json!(10), Some(&slow));
        assert!(out.logic_result.triggered);
        assert!(!out.logic_result.tainted);
        assert!(out.skipped_slow.is_empty());
        assert_eq!(out.evaluated_priority, PriorityLevel::High);
        let ids: Vec<_> = out.condition_results.iter().map(|r| r.condition_id).collect();
        assert_eq!(ids, vec![ConditionId(1), ConditionId(2)]);
    }

    #[test]
    fn missing_slow_evaluator_taints() {
        let group = DataConditionGroup::any(vec![gt(1, 50, json!(50)), anomaly(2, json!(75))]);
        let out = process_condition_group(&group, &json!(10), None);
        assert!(!out.logic_result.triggered);
        assert!(out.logic_result.tainted);
        assert_eq!(out.skipped_slow, vec![ConditionId(2)]);
    }

    #[test]
    fn failing_slow_evaluator_taints() {
        let group = DataConditionGroup::any(vec![anomaly(1, json!(75))]);
        let slow = FixedSlow(Err(ConditionError::Unavailable {
            condition_id: ConditionId(1),
            reason: "timeout".to_string(),
        }));
        let out = process_condition_group(&group, &json!(10), Some(&slow));
        assert!(!out.logic_result.triggered);
        assert!(out.logic_result.tainted);
    }

    #[test]
    fn all_logic_short_circuits_on_failure_without_taint() {
        let group = DataConditionGroup::new(
            LogicType::All,
            vec![gt(1, 50, json!(75)), anomaly(2, json!(75))],
        );
        let out = process_condition_group(&group, &json!(10), None);
        assert!(!out.logic_result.triggered);
        assert!(!out.logic_result.tainted);
        assert_eq!(out.skipped_slow, vec![ConditionId(2)]);
    }

    #[test]
    fn all_logic_requires_every_condition() {
        let group = DataConditionGroup::new(
            LogicType::All,
            vec![gt(1, 5, json!(50)), gt(2, 8, json!(75))],
        );
        let out = process_condition_group(&group, &json!(10), None);
        assert!(out.logic_result.triggered);
        assert_eq!(out.evaluated_priority, PriorityLevel::High);

        let out = process_condition_group(&group, &json!(6), None);
        assert!(!out.logic_result.triggered);
        assert_eq!(out.evaluated_priority, PriorityLevel::Ok);
    }

    #[test]
    fn none_logic_triggers_when_nothing_passes() {
        let group = DataConditionGroup::new(LogicType::None, vec![gt(1, 5, json!(75))]);
        let out = process_condition_group(&group, &json!(1), None);
        assert!(out.logic_result.triggered);
        assert_eq!(out.evaluated_priority, PriorityLevel::Ok);

        let out = process_condition_group(&group, &json!(10), None);
        assert!(!out.logic_result.triggered);
    }
}
