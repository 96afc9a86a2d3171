//! Evaluation results.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::occurrence::{IssueOccurrence, StatusChangeMessage};
use crate::packet::GroupKey;
use crate::priority::PriorityLevel;

/// Lifecycle transition reported for a group key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    /// Entered or escalated to a triggered level.
    Occurrence(Box<IssueOccurrence>),
    /// Returned to `Ok`.
    Resolution(StatusChangeMessage),
}

/// Final output for one group key of one evaluation pass.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorEvaluationResult {
    pub group_key: GroupKey,
    pub is_triggered: bool,
    pub priority: PriorityLevel,
    pub outcome: EvaluationOutcome,
    /// Auxiliary event metadata accompanying an occurrence.
    pub event_data: Option<serde_json::Value>,
}

impl DetectorEvaluationResult {
    /// The occurrence, if this result opened or escalated an issue.
    #[must_use]
    pub fn occurrence(&self) -> Option<&IssueOccurrence> {
        match &self.outcome {
            EvaluationOutcome::Occurrence(occurrence) => Some(occurrence),
            EvaluationOutcome::Resolution(_) => None,
        }
    }

    /// The resolution, if this result returned the group key to `Ok`.
    #[must_use]
    pub fn resolution(&self) -> Option<&StatusChangeMessage> {
        match &self.outcome {
            EvaluationOutcome::Resolution(message) => Some(message),
            EvaluationOutcome::Occurrence(_) => None,
        }
    }
}

/// Output of one `evaluate` call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupedEvaluationResult {
    /// Group keys that transitioned in this pass.
    pub results: HashMap<GroupKey, DetectorEvaluationResult>,
    /// Some group key's conditions were evaluated without every slow
    /// condition.
    pub tainted: bool,
}

impl GroupedEvaluationResult {
    /// True when nothing transitioned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Number of transitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Result for `group_key`.
    #[must_use]
    pub fn get(&self, group_key: &GroupKey) -> Option<&DetectorEvaluationResult> {
        self.results.get(group_key)
    }
}
