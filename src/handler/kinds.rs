//! Built-in detector kinds.

use serde_json::Value;

use crate::detector::Detector;
use crate::error::EvaluationError;
use crate::occurrence::IssueEvidence;
use crate::packet::{DataPacket, GroupKey};

use super::behavior::{DetectorBehavior, Evidence, EvidenceContext, GroupedValues};

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn passed_condition_ids(ctx: &EvidenceContext<'_>) -> String {
    ctx.processed
        .passed()
        .map(|r| r.condition_id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Single-value metric detector.
///
/// Payload: `{"value": <number>}`. Evaluates under the `None` group key.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricThresholdBehavior;

impl MetricThresholdBehavior {
    /// Registry slug.
    pub const SLUG: &'static str = "metric_threshold";
}

impl DetectorBehavior for MetricThresholdBehavior {
    fn slug(&self) -> &'static str {
        Self::SLUG
    }

    fn extract_value(&self, packet: &DataPacket) -> Result<GroupedValues, EvaluationError> {
        let value = packet
            .payload
            .get("value")
            .ok_or_else(|| EvaluationError::ValueExtraction {
                reason: "payload has no 'value' field".to_string(),
            })?;
        Ok(GroupedValues::from([(None, value.clone())]))
    }

    fn build_evidence(&self, ctx: &EvidenceContext<'_>) -> Result<Evidence, EvaluationError> {
        let value = render_value(ctx.value);
        Ok(Evidence {
            issue_title: format!("{} is {}", ctx.detector.name, ctx.priority),
            subtitle: format!("Value {value} matched conditions {}", passed_condition_ids(ctx)),
            evidence_data: serde_json::Map::new(),
            evidence_display: vec![
                IssueEvidence::new("Value", value, true),
                IssueEvidence::new("Priority", ctx.priority.to_string(), false),
            ],
        })
    }
}

/// Detector fanning one packet out to many group keys.
///
/// Payload: `{"groups": {"<group key>": <value>, ...}}`. The optional
/// `group_by` config entry names what the keys are (e.g. a tag name) and is
/// part of the fingerprint.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupedValuesBehavior;

impl GroupedValuesBehavior {
    /// Registry slug.
    pub const SLUG: &'static str = "grouped_values";

    fn group_by(detector: &Detector) -> Option<&str> {
        detector.config.get("group_by").and_then(Value::as_str)
    }
}

impl DetectorBehavior for GroupedValuesBehavior {
    fn slug(&self) -> &'static str {
        Self::SLUG
    }

    fn extract_value(&self, packet: &DataPacket) -> Result<GroupedValues, EvaluationError> {
        let groups = packet
            .payload
            .get("groups")
            .and_then(Value::as_object)
            .ok_or_else(|| EvaluationError::ValueExtraction {
                reason: "payload has no 'groups' object".to_string(),
            })?;
        Ok(groups
            .iter()
            .map(|(key, value)| (Some(key.clone()), value.clone()))
            .collect())
    }

    fn build_evidence(&self, ctx: &EvidenceContext<'_>) -> Result<Evidence, EvaluationError> {
        let group = ctx.group_key.as_deref().ok_or_else(|| EvaluationError::Evidence {
            group_key: None,
            reason: "grouped detector evaluated without a group key".to_string(),
        })?;
        let group_by = Self::group_by(ctx.detector).unwrap_or("group");
        let value = render_value(ctx.value);

        let mut evidence_data = serde_json::Map::new();
        evidence_data.insert("group_by".to_string(), Value::String(group_by.to_string()));
        evidence_data.insert("group".to_string(), Value::String(group.to_string()));

        Ok(Evidence {
            issue_title: format!("{} is {} for {group_by}={group}", ctx.detector.name, ctx.priority),
            subtitle: format!("Value {value} matched conditions {}", passed_condition_ids(ctx)),
            evidence_data,
            evidence_display: vec![
                IssueEvidence::new(group_by, group, true),
                IssueEvidence::new("Value", value, true),
            ],
        })
    }

    fn build_fingerprint_extra(&self, detector: &Detector, _group_key: &GroupKey) -> Vec<String> {
        Self::group_by(detector)
            .map(|name| vec![format!("group_by:{name}")])
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::detector::{DetectorId, ProjectId};

    #[test]
    fn metric_extracts_single_value() {
        let packet = DataPacket::new("s", 1, json!({"value": 10}));
        let values = MetricThresholdBehavior.extract_value(&packet).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[&None::<String>], json!(10));
    }

    #[test]
    fn metric_rejects_missing_value() {
        let packet = DataPacket::new("s", 1, json!({"other": 10}));
        assert!(matches!(
            MetricThresholdBehavior.extract_value(&packet),
            Err(EvaluationError::ValueExtraction { .. })
        ));
    }

    #[test]
    fn grouped_fans_out_per_key() {
        let packet = DataPacket::new("s", 1, json!({"groups": {"a": 1, "b": 2}}));
        let values = GroupedValuesBehavior.extract_value(&packet).unwrap();
        let keys: Vec<_> = values.keys().cloned().collect();
        assert_eq!(keys, vec![Some("a".to_string()), Some("b".to_string())]);
    }

    #[test]
    fn grouped_fingerprint_extra_uses_group_by() {
        let detector = Detector::new(DetectorId(1), ProjectId(1), "d", GroupedValuesBehavior::SLUG)
            .with_config("group_by", json!("region"));
        assert_eq!(
            GroupedValuesBehavior.build_fingerprint_extra(&detector, &Some("eu".to_string())),
            vec!["group_by:region".to_string()]
        );
    }

    #[test]
    fn default_dedupe_value_is_sequence() {
        let packet = DataPacket::new("s", 17, json!({}));
        assert_eq!(MetricThresholdBehavior.extract_dedupe_value(&packet), 17);
    }
}
