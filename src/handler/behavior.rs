//! Detector kinds.
//!
//! The stateful handler is generic; everything that differs between kinds of
//! detector goes through [`DetectorBehavior`]. Kinds are looked up through an
//! explicit [`DetectorKindRegistry`] built at startup.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::condition::ProcessedConditionGroup;
use crate::data_source::DataSource;
use crate::detector::Detector;
use crate::error::{ConfigError, EvaluationError};
use crate::occurrence::IssueEvidence;
use crate::packet::{DataPacket, GroupKey};
use crate::priority::PriorityLevel;

use super::kinds::{GroupedValuesBehavior, MetricThresholdBehavior};

/// Values extracted from one packet, keyed by group key.
pub type GroupedValues = BTreeMap<GroupKey, serde_json::Value>;

/// Everything known when an occurrence is built for one group key.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy)]
pub struct EvidenceContext<'a> {
    pub detector: &'a Detector,
    pub group_key: &'a GroupKey,
    pub value: &'a serde_json::Value,
    pub processed: &'a ProcessedConditionGroup,
    pub priority: PriorityLevel,
    pub packet: &'a DataPacket,
    pub data_sources: &'a [DataSource],
}

/// Kind-specific parts of an occurrence.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Evidence {
    pub issue_title: String,
    pub subtitle: String,
    /// Merged over the handler's base evidence data.
    pub evidence_data: serde_json::Map<String, serde_json::Value>,
    pub evidence_display: Vec<IssueEvidence>,
}

/// Capabilities that vary by detector kind.
pub trait DetectorBehavior: Send + Sync {
    /// Registry slug, matched against `Detector::kind`.
    fn slug(&self) -> &'static str;

    /// Dedupe value of `packet`. Defaults to its sequence.
    fn extract_dedupe_value(&self, packet: &DataPacket) -> u64 {
        packet.sequence
    }

    /// Values to evaluate, one per group key.
    ///
    /// # Errors
    /// Returns `ValueExtraction` when the payload has the wrong shape.
    fn extract_value(&self, packet: &DataPacket) -> Result<GroupedValues, EvaluationError>;

    /// Title, display rows, and extra evidence for an occurrence.
    ///
    /// # Errors
    /// Returns `Evidence` when the occurrence cannot be described.
    fn build_evidence(&self, ctx: &EvidenceContext<'_>) -> Result<Evidence, EvaluationError>;

    /// Fingerprint components appended after the detector/group key part.
    fn build_fingerprint_extra(&self, _detector: &Detector, _group_key: &GroupKey) -> Vec<String> {
        Vec::new()
    }
}

/// Maps kind slugs to behaviors.
#[derive(Default, Clone)]
pub struct DetectorKindRegistry {
    kinds: HashMap<&'static str, Arc<dyn DetectorBehavior>>,
}

impl DetectorKindRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the kinds shipped with this crate.
    #[must_use]
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();
        registry
            .kinds
            .insert(MetricThresholdBehavior::SLUG, Arc::new(MetricThresholdBehavior));
        registry
            .kinds
            .insert(GroupedValuesBehavior::SLUG, Arc::new(GroupedValuesBehavior));
        registry
    }

    /// Register a behavior under its slug.
    ///
    /// # Errors
    /// Returns `InvalidSetting` if the slug is already taken.
    pub fn register(&mut self, behavior: Arc<dyn DetectorBehavior>) -> Result<(), ConfigError> {
        let slug = behavior.slug();
        if self.kinds.contains_key(slug) {
            return Err(ConfigError::InvalidSetting {
                component: "detector_kind_registry",
                reason: format!("kind '{slug}' is already registered"),
            });
        }
        self.kinds.insert(slug, behavior);
        Ok(())
    }

    /// Behavior for `kind`.
    ///
    /// # Errors
    /// Returns `UnknownDetectorKind` when nothing is registered under `kind`.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn DetectorBehavior>, ConfigError> {
        self.kinds
            .get(kind)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDetectorKind {
                kind: kind.to_string(),
            })
    }

    /// Registered slugs, sorted.
    #[must_use]
    pub fn slugs(&self) -> Vec<&'static str> {
        let mut slugs: Vec<_> = self.kinds.keys().copied().collect();
        slugs.sort_unstable();
        slugs
    }
}

impl std::fmt::Debug for DetectorKindRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorKindRegistry")
            .field("kinds", &self.slugs())
            .finish()
    }
}
