//! Detector priority levels.
//!
//! Levels are totally ordered by severity. `Ok` is the resting, non-triggered
//! level; every other level corresponds to an open occurrence.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a detector state.
///
/// `Medium` is what alert rules call "warning" and `High` is "critical".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    /// Resting level.
    Ok,
    /// Low severity.
    Low,
    /// Medium severity.
    #[serde(alias = "warning")]
    Medium,
    /// High severity.
    #[serde(alias = "critical")]
    High,
}

impl PriorityLevel {
    /// All levels, lowest severity first.
    pub const ALL: [Self; 4] = [Self::Ok, Self::Low, Self::Medium, Self::High];

    /// Numeric value used by condition results.
    #[must_use]
    pub const fn value(self) -> i64 {
        match self {
            Self::Ok => 0,
            Self::Low => 25,
            Self::Medium => 50,
            Self::High => 75,
        }
    }

    /// Look up a level by its numeric value.
    #[must_use]
    pub const fn from_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            25 => Some(Self::Low),
            50 => Some(Self::Medium),
            75 => Some(Self::High),
            _ => None,
        }
    }

    /// Stable lowercase name, used in state keys and fingerprints.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Parse a level name, accepting the alert-rule aliases.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ok" => Some(Self::Ok),
            "low" => Some(Self::Low),
            "medium" | "warning" => Some(Self::Medium),
            "high" | "critical" => Some(Self::High),
            _ => None,
        }
    }

    /// Interpret a configured condition result.
    ///
    /// Accepts the numeric values and the level names. Anything else is not a
    /// priority and yields `None`.
    #[must_use]
    pub fn from_condition_result(result: &serde_json::Value) -> Option<Self> {
        match result {
            serde_json::Value::Number(n) => n.as_i64().and_then(Self::from_value),
            serde_json::Value::String(s) => Self::from_name(s),
            _ => None,
        }
    }

    /// True for every level other than `Ok`.
    #[must_use]
    pub const fn is_triggered(self) -> bool {
        !matches!(self, Self::Ok)
    }
}

impl Default for PriorityLevel {
    fn default() -> Self {
        Self::Ok
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
