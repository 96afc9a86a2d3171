//! Issue occurrences, resolution messages, and the emitter boundary.
//!
//! The engine builds these records; delivering them (message bus, retries) is
//! the emitter's concern.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::detector::{DetectorId, ProjectId};
use crate::packet::GroupKey;
use crate::priority::PriorityLevel;

/// One entry of the human-facing evidence list.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueEvidence {
    pub name: String,
    pub value: String,
    pub important: bool,
}

impl IssueEvidence {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>, important: bool) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            important,
        }
    }
}

/// A newly detected or escalated issue state.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueOccurrence {
    /// Deterministic per `(detector, group_key, dedupe_value)`.
    pub id: Uuid,
    pub event_id: Uuid,
    pub project_id: ProjectId,
    pub fingerprint: Vec<String>,
    pub issue_title: String,
    pub subtitle: String,
    pub priority: PriorityLevel,
    pub evidence_data: serde_json::Map<String, serde_json::Value>,
    pub evidence_display: Vec<IssueEvidence>,
    pub detection_time: DateTime<Utc>,
}

/// Group status carried by status change messages. Issues are opened by
/// occurrences, so only resolution travels this way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Issue returned to OK.
    Resolved,
}

/// A return to the OK state.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangeMessage {
    pub fingerprint: Vec<String>,
    pub project_id: ProjectId,
    pub new_status: GroupStatus,
    pub update_at: DateTime<Utc>,
}

impl StatusChangeMessage {
    /// A resolution for the issue identified by `fingerprint`.
    #[must_use]
    pub fn resolved(fingerprint: Vec<String>, project_id: ProjectId) -> Self {
        Self {
            fingerprint,
            project_id,
            new_status: GroupStatus::Resolved,
            update_at: Utc::now(),
        }
    }
}

/// Fingerprint of the issue tracked for `group_key`.
///
/// The first component is the detector id, suffixed with `:<group_key>` when
/// the key is set. Extra components follow unchanged.
#[must_use]
pub fn build_fingerprint(
    detector_id: DetectorId,
    group_key: &GroupKey,
    extra: Vec<String>,
) -> Vec<String> {
    let base = match group_key {
        Some(key) => format!("{detector_id}:{key}"),
        None => detector_id.to_string(),
    };
    let mut fingerprint = Vec::with_capacity(1 + extra.len());
    fingerprint.push(base);
    fingerprint.extend(extra);
    fingerprint
}

/// Occurrence id for the transition produced by `dedupe_value`.
///
/// Redelivering the same packet yields the same id, so downstream consumers
/// can drop repeats.
#[must_use]
pub fn occurrence_id(detector_id: DetectorId, group_key: &GroupKey, dedupe_value: u64) -> Uuid {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"occurrence\0");
    hasher.update(&detector_id.0.to_le_bytes());
    match group_key {
        Some(key) => {
            hasher.update(&[1]);
            hasher.update(key.as_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
    hasher.update(&dedupe_value.to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// Errors delivering occurrences.
#[derive(Debug, Error)]
pub enum EmitError {
    /// The downstream transport rejected or dropped the message.
    #[error("Failed to emit message: {0}")]
    Delivery(String),
}

/// Receives finished occurrences and resolutions.
pub trait OccurrenceEmitter: Send + Sync {
    /// Hand off a new or escalated occurrence.
    fn emit_occurrence(
        &self,
        occurrence: &IssueOccurrence,
        event_data: Option<&serde_json::Value>,
    ) -> Result<(), EmitError>;

    /// Hand off a resolution.
    fn emit_status_change(&self, message: &StatusChangeMessage) -> Result<(), EmitError>;
}

/// Emitter that keeps everything in memory.
#[derive(Debug, Default)]
pub struct CollectingEmitter {
    occurrences: Mutex<Vec<IssueOccurrence>>,
    status_changes: Mutex<Vec<StatusChangeMessage>>,
}

impl CollectingEmitter {
    /// Create an empty emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Occurrences emitted so far.
    #[must_use]
    pub fn occurrences(&self) -> Vec<IssueOccurrence> {
        self.occurrences
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Resolutions emitted so far.
    #[must_use]
    pub fn status_changes(&self) -> Vec<StatusChangeMessage> {
        self.status_changes
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl OccurrenceEmitter for CollectingEmitter {
    fn emit_occurrence(
        &self,
        occurrence: &IssueOccurrence,
        _event_data: Option<&serde_json::Value>,
    ) -> Result<(), EmitError> {
        self.occurrences
            .lock()
            .map_err(|_| EmitError::Delivery("poisoned lock: occurrences".to_string()))?
            .push(occurrence.clone());
        Ok(())
    }

    fn emit_status_change(&self, message: &StatusChangeMessage) -> Result<(), EmitError> {
        self.status_changes
            .lock()
            .map_err(|_| EmitError::Delivery("poisoned lock: status_changes".to_string()))?
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_includes_group_key_and_extra() {
        let fp = build_fingerprint(DetectorId(9), &Some("eu".to_string()), vec!["x".to_string()]);
        assert_eq!(fp, vec!["9:eu".to_string(), "x".to_string()]);

        let fp = build_fingerprint(DetectorId(9), &None, Vec::new());
        assert_eq!(fp, vec!["9".to_string()]);
    }

    #[test]
    fn occurrence_id_is_deterministic() {
        let a = occurrence_id(DetectorId(1), &None, 5);
        let b = occurrence_id(DetectorId(1), &None, 5);
        assert_eq!(a, b);
        assert_ne!(a, occurrence_id(DetectorId(1), &None, 6));
        assert_ne!(a, occurrence_id(DetectorId(1), &Some(String::new()), 5));
    }

    #[test]
    fn resolved_message_has_resolved_status() {
        let msg = StatusChangeMessage::resolved(vec!["1".to_string()], ProjectId(3));
        assert_eq!(msg.new_status, GroupStatus::Resolved);
        assert_eq!(msg.project_id, ProjectId(3));
    }
}
