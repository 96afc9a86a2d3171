//! Individual data conditions.
//!
//! Fast conditions are pure comparisons against the extracted value. Slow
//! conditions need an external lookup and are delegated to a
//! [`SlowConditionEvaluator`].

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a condition within a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionId(pub u64);

impl fmt::Display for ConditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supported condition types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    /// `value > comparison`
    Gt,
    /// `value >= comparison`
    Gte,
    /// `value < comparison`
    Lt,
    /// `value <= comparison`
    Lte,
    /// Numeric or JSON equality.
    Eq,
    /// Negation of `Eq`.
    Ne,
    /// String form of the value matches the regex in `comparison`.
    Matches,
    /// Anomaly detection backed by an external service.
    AnomalyDetection,
}

impl ConditionType {
    /// True for conditions that require an external lookup.
    #[must_use]
    pub const fn is_slow(self) -> bool {
        matches!(self, Self::AnomalyDetection)
    }
}

/// Errors evaluating a single condition.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConditionError {
    /// The configured comparison cannot be used with this condition type.
    #[error("condition {condition_id}: invalid comparison: {reason}")]
    InvalidComparison {
        /// Offending condition.
        condition_id: ConditionId,
        /// Details.
        reason: String,
    },

    /// The extracted value cannot be compared.
    #[error("condition {condition_id}: value {value} is not comparable")]
    IncomparableValue {
        /// Offending condition.
        condition_id: ConditionId,
        /// Extracted value.
        value: serde_json::Value,
    },

    /// A slow condition could not be evaluated.
    #[error("condition {condition_id}: evaluator unavailable: {reason}")]
    Unavailable {
        /// Offending condition.
        condition_id: ConditionId,
        /// Details.
        reason: String,
    },
}

/// One configured condition: a predicate plus the result it yields on match.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataCondition {
    pub id: ConditionId,
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub comparison: serde_json::Value,
    /// Usually a priority level; anything else is ignored for priority.
    pub condition_result: serde_json::Value,
    #[serde(skip)]
    compiled: CompiledPattern,
}

/// Regex compiled on first use, keyed by its source pattern.
#[derive(Debug, Clone, Default)]
struct CompiledPattern(OnceLock<(String, Regex)>);

impl PartialEq for CompiledPattern {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl DataCondition {
    #[must_use]
    pub fn new(
        id: u64,
        condition_type: ConditionType,
        comparison: serde_json::Value,
        condition_result: serde_json::Value,
    ) -> Self {
        Self {
            id: ConditionId(id),
            condition_type,
            comparison,
            condition_result,
            compiled: CompiledPattern::default(),
        }
    }

    /// True for conditions that require an external lookup.
    #[must_use]
    pub const fn is_slow(&self) -> bool {
        self.condition_type.is_slow()
    }

    /// Evaluate a fast condition against `value`.
    ///
    /// # Errors
    /// Returns `InvalidComparison` or `IncomparableValue` for malformed
    /// configuration or values, and `Unavailable` when called on a slow
    /// condition.
    pub fn evaluate_fast(&self, value: &serde_json::Value) -> Result<bool, ConditionError> {
        match self.condition_type {
            ConditionType::Gt => self.compare_numeric(value, |v, c| v > c),
            ConditionType::Gte => self.compare_numeric(value, |v, c| v >= c),
            ConditionType::Lt => self.compare_numeric(value, |v, c| v < c),
            ConditionType::Lte => self.compare_numeric(value, |v, c| v <= c),
            ConditionType::Eq => Ok(self.values_equal(value)),
            ConditionType::Ne => Ok(!self.values_equal(value)),
            ConditionType::Matches => self.matches_pattern(value),
            ConditionType::AnomalyDetection => Err(ConditionError::Unavailable {
                condition_id: self.id,
                reason: "slow condition evaluated on the fast path".to_string(),
            }),
        }
    }

    fn compare_numeric(
        &self,
        value: &serde_json::Value,
        op: impl Fn(f64, f64) -> bool,
    ) -> Result<bool, ConditionError> {
        let comparison = as_number(&self.comparison).ok_or_else(|| {
            ConditionError::InvalidComparison {
                condition_id: self.id,
                reason: format!("expected a number, got {}", self.comparison),
            }
        })?;
        let value = as_number(value).ok_or_else(|| ConditionError::IncomparableValue {
            condition_id: self.id,
            value: value.clone(),
        })?;
        Ok(op(value, comparison))
    }

    fn values_equal(&self, value: &serde_json::Value) -> bool {
        match (as_number(value), as_number(&self.comparison)) {
            (Some(v), Some(c)) => (v - c).abs() < f64::EPSILON,
            _ => value == &self.comparison,
        }
    }

    fn matches_pattern(&self, value: &serde_json::Value) -> Result<bool, ConditionError> {
        let pattern = self.comparison.as_str().ok_or_else(|| ConditionError::InvalidComparison {
            condition_id: self.id,
            reason: format!("expected a regex string, got {}", self.comparison),
        })?;
        let compiled;
        let re = match self.compiled.0.get() {
            Some((source, re)) if source == pattern => re,
            _ => {
                compiled = Regex::new(pattern).map_err(|e| ConditionError::InvalidComparison {
                    condition_id: self.id,
                    reason: e.to_string(),
                })?;
                // First pattern wins the cache; an edited comparison compiles per call.
                let _ = self.compiled.0.set((pattern.to_string(), compiled.clone()));
                &compiled
            }
        };
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            other => {
                return Err(ConditionError::IncomparableValue {
                    condition_id: self.id,
                    value: other.clone(),
                })
            }
        };
        Ok(re.is_match(&text))
    }
}

/// Numbers and numeric strings compare as `f64`.
fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Evaluates conditions that need an external lookup.
pub trait SlowConditionEvaluator: Send + Sync {
    /// Evaluate `condition` against `value`.
    ///
    /// # Errors
    /// Returns `Unavailable` when the backing service cannot answer.
    fn evaluate(
        &self,
        condition: &DataCondition,
        value: &serde_json::Value,
    ) -> Result<bool, ConditionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparisons() {
        let gt = DataCondition::new(1, ConditionType::Gt, json!(5), json!(75));
        assert!(gt.evaluate_fast(&json!(10)).unwrap());
        assert!(!gt.evaluate_fast(&json!(5)).unwrap());

        let lte = DataCondition::new(2, ConditionType::Lte, json!(5), json!(75));
        assert!(lte.evaluate_fast(&json!(5.0)).unwrap());
    }

    #[test]
    fn numeric_strings_are_compared_as_numbers() {
        let gt = DataCondition::new(1, ConditionType::Gt, json!("5"), json!(75));
        assert!(gt.evaluate_fast(&json!("10")).unwrap());
        assert!(!gt.evaluate_fast(&json!("0")).unwrap());
    }

    #[test]
    fn malformed_comparison_is_an_error() {
        let gt = DataCondition::new(1, ConditionType::Gt, json!({"x": 1}), json!(75));
        assert!(matches!(
            gt.evaluate_fast(&json!(10)),
            Err(ConditionError::InvalidComparison { .. })
        ));

        let gt = DataCondition::new(1, ConditionType::Gt, json!(1), json!(75));
        assert!(matches!(
            gt.evaluate_fast(&json!("ten")),
            Err(ConditionError::IncomparableValue { .. })
        ));
    }

    #[test]
    fn equality_falls_back_to_json() {
        let eq = DataCondition::new(1, ConditionType::Eq, json!("down"), json!(75));
        assert!(eq.evaluate_fast(&json!("down")).unwrap());
        let ne = DataCondition::new(2, ConditionType::Ne, json!("down"), json!(75));
        assert!(ne.evaluate_fast(&json!("up")).unwrap());
        let eq_num = DataCondition::new(3, ConditionType::Eq, json!(3), json!(75));
        assert!(eq_num.evaluate_fast(&json!(3.0)).unwrap());
    }

    #[test]
    fn regex_matches() {
        let m = DataCondition::new(1, ConditionType::Matches, json!("^5\\d\\d$"), json!(50));
        assert!(m.evaluate_fast(&json!(503)).unwrap());
        assert!(!m.evaluate_fast(&json!("200")).unwrap());

        let bad = DataCondition::new(2, ConditionType::Matches, json!("("), json!(50));
        assert!(matches!(
            bad.evaluate_fast(&json!("x")),
            Err(ConditionError::InvalidComparison { .. })
        ));
    }

    #[test]
    fn compiled_pattern_follows_comparison() {
        let mut m = DataCondition::new(1, ConditionType::Matches, json!("^err"), json!(50));
        assert!(m.evaluate_fast(&json!("error: disk")).unwrap());
        assert!(m.compiled.0.get().is_some());
        assert!(m.evaluate_fast(&json!("errno 5")).unwrap());

        m.comparison = json!("^warn");
        assert!(!m.evaluate_fast(&json!("error: disk")).unwrap());
        assert!(m.evaluate_fast(&json!("warning")).unwrap());

        let copy = m.clone();
        assert_eq!(copy, m);
        assert!(copy.evaluate_fast(&json!("warning")).unwrap());
    }

    #[test]
    fn slow_condition_refuses_fast_path() {
        let c = DataCondition::new(1, ConditionType::AnomalyDetection, json!({}), json!(75));
        assert!(c.is_slow());
        assert!(matches!(
            c.evaluate_fast(&json!(1)),
            Err(ConditionError::Unavailable { .. })
        ));
    }
}
