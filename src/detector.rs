//! Detector configuration.
//!
//! Detectors are created and updated outside the engine. The evaluation path
//! only ever reads them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::condition::DataConditionGroup;
use crate::error::ConfigError;
use crate::priority::PriorityLevel;

/// Stable identifier for a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectorId(pub u64);

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the project owning a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consecutive-breach counts required to enter each priority level.
///
/// Always contains an entry for `Ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<PriorityLevel, u64>", into = "BTreeMap<PriorityLevel, u64>")]
pub struct Thresholds {
    levels: BTreeMap<PriorityLevel, u64>,
}

impl Thresholds {
    /// Default count for levels that are not configured explicitly.
    pub const DEFAULT_COUNT: u64 = 1;

    /// Build thresholds from explicit per-level counts.
    ///
    /// # Errors
    /// Returns `InvalidThreshold` if any count is zero.
    pub fn new(levels: BTreeMap<PriorityLevel, u64>) -> Result<Self, ConfigError> {
        if let Some((level, count)) = levels.iter().find(|(_, count)| **count == 0) {
            return Err(ConfigError::InvalidThreshold {
                level: level.to_string(),
                count: *count,
            });
        }

        let mut levels = levels;
        levels.entry(PriorityLevel::Ok).or_insert(Self::DEFAULT_COUNT);
        Ok(Self { levels })
    }

    /// Thresholds of one for `Ok` and each of `levels`.
    #[must_use]
    pub fn immediate(levels: &[PriorityLevel]) -> Self {
        let mut map: BTreeMap<PriorityLevel, u64> = levels
            .iter()
            .map(|level| (*level, Self::DEFAULT_COUNT))
            .collect();
        map.entry(PriorityLevel::Ok).or_insert(Self::DEFAULT_COUNT);
        Self { levels: map }
    }

    /// Parse thresholds from a `{"<level name>": <count>}` JSON object.
    ///
    /// # Errors
    /// Returns `UnparseableThresholds` for unknown level names or non-integer
    /// counts, and `InvalidThreshold` for zero counts.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let obj = value.as_object().ok_or_else(|| ConfigError::UnparseableThresholds {
            reason: format!("expected an object, got {value}"),
        })?;

        let mut levels = BTreeMap::new();
        for (name, count) in obj {
            let level = PriorityLevel::from_name(name).ok_or_else(|| {
                ConfigError::UnparseableThresholds {
                    reason: format!("unknown priority level '{name}'"),
                }
            })?;
            let count = count.as_u64().ok_or_else(|| ConfigError::UnparseableThresholds {
                reason: format!("count for '{name}' must be a non-negative integer, got {count}"),
            })?;
            levels.insert(level, count);
        }
        Self::new(levels)
    }

    /// Count required for `level`, if configured.
    #[must_use]
    pub fn get(&self, level: PriorityLevel) -> Option<u64> {
        self.levels.get(&level).copied()
    }

    /// Configured levels, lowest severity first.
    pub fn levels(&self) -> impl DoubleEndedIterator<Item = PriorityLevel> + '_ {
        self.levels.keys().copied()
    }

    /// Configured `(level, count)` pairs, most severe first.
    pub fn most_severe_first(&self) -> impl Iterator<Item = (PriorityLevel, u64)> + '_ {
        self.levels.iter().rev().map(|(level, count)| (*level, *count))
    }
}

/// Every level at `DEFAULT_COUNT`.
impl Default for Thresholds {
    fn default() -> Self {
        Self::immediate(&PriorityLevel::ALL)
    }
}

impl TryFrom<BTreeMap<PriorityLevel, u64>> for Thresholds {
    type Error = ConfigError;

    fn try_from(levels: BTreeMap<PriorityLevel, u64>) -> Result<Self, Self::Error> {
        Self::new(levels)
    }
}

impl From<Thresholds> for BTreeMap<PriorityLevel, u64> {
    fn from(value: Thresholds) -> Self {
        value.levels
    }
}

/// A configured monitor.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detector {
    pub id: DetectorId,
    pub project_id: ProjectId,
    pub name: String,
    /// Slug of the detector kind, resolved through the kind registry.
    pub kind: String,
    #[serde(default)]
    pub condition_group: Option<DataConditionGroup>,
    /// Free-form detector parameters.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub thresholds: Thresholds,
}

impl Detector {
    /// Create a detector that enters any level on its first breach and has no
    /// condition group.
    #[must_use]
    pub fn new(
        id: DetectorId,
        project_id: ProjectId,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            id,
            project_id,
            name: name.into(),
            kind: kind.into(),
            condition_group: None,
            config: serde_json::Map::new(),
            thresholds: Thresholds::default(),
        }
    }

    #[must_use]
    pub fn with_condition_group(mut self, group: DataConditionGroup) -> Self {
        self.condition_group = Some(group);
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Thresholds in effect for this detector.
    ///
    /// A `"thresholds"` entry in `config` overrides the typed field.
    ///
    /// # Errors
    /// Returns a `ConfigError` if the config entry cannot be parsed.
    pub fn effective_thresholds(&self) -> Result<Thresholds, ConfigError> {
        match self.config.get("thresholds") {
            Some(value) => Thresholds::from_json(value),
            None => Ok(self.thresholds.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thresholds_always_include_ok() {
        let t = Thresholds::new(BTreeMap::from([(PriorityLevel::High, 3)])).unwrap();
        assert_eq!(t.get(PriorityLevel::Ok), Some(1));
        assert_eq!(t.get(PriorityLevel::High), Some(3));
        assert_eq!(t.get(PriorityLevel::Medium), None);
    }

    #[test]
    fn explicit_ok_threshold_is_kept() {
        let t = Thresholds::new(BTreeMap::from([(PriorityLevel::Ok, 4)])).unwrap();
        assert_eq!(t.get(PriorityLevel::Ok), Some(4));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = Thresholds::new(BTreeMap::from([(PriorityLevel::Low, 0)])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { .. }));
    }

    #[test]
    fn most_severe_first_ordering() {
        let t = Thresholds::immediate(&[PriorityLevel::Medium, PriorityLevel::High]);
        let order: Vec<_> = t.most_severe_first().map(|(l, _)| l).collect();
        assert_eq!(
            order,
            vec![PriorityLevel::High, PriorityLevel::Medium, PriorityLevel::Ok]
        );
    }

    #[test]
    fn default_thresholds_are_immediate() {
        let t = Thresholds::default();
        assert_eq!(t.levels().count(), 4);
        assert!(t.most_severe_first().all(|(_, count)| count == 1));
    }

    #[test]
    fn parses_thresholds_from_json() {
        let t = Thresholds::from_json(&json!({"warning": 2, "critical": 1})).unwrap();
        assert_eq!(t.get(PriorityLevel::Medium), Some(2));
        assert_eq!(t.get(PriorityLevel::High), Some(1));
        assert_eq!(t.get(PriorityLevel::Ok), Some(1));

        assert!(Thresholds::from_json(&json!({"severe": 2})).is_err());
        assert!(Thresholds::from_json(&json!({"high": "three"})).is_err());
        assert!(Thresholds::from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn config_thresholds_override_field() {
        let detector = Detector::new(DetectorId(1), ProjectId(1), "d", "metric_threshold")
            .with_thresholds(Thresholds::immediate(&[PriorityLevel::High]))
            .with_config("thresholds", json!({"high": 5}));
        let t = detector.effective_thresholds().unwrap();
        assert_eq!(t.get(PriorityLevel::High), Some(5));
    }

    #[test]
    fn thresholds_serde_validates() {
        let t: Thresholds = serde_json::from_value(json!({"high": 2})).unwrap();
        assert_eq!(t.get(PriorityLevel::Ok), Some(1));
        assert!(serde_json::from_value::<Thresholds>(json!({"high": 0})).is_err());
    }
}
