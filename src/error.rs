//! Error types for the detector engine.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! failure class. Configuration problems and evidence failures are handled
//! inside an evaluation pass; storage failures abort the pass and are surfaced
//! to the transport, which owns retry policy.

use thiserror::Error;

use crate::detector::DetectorId;
use crate::storage::StorageError;

/// Errors caused by detector configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Detector {detector_id} has no condition group")]
    MissingConditionGroup {
        detector_id: DetectorId,
    },

    #[error("Threshold for level '{level}' must be at least 1 (got {count})")]
    InvalidThreshold {
        level: String,
        count: u64,
    },

    #[error("Unparseable threshold configuration: {reason}")]
    UnparseableThresholds {
        reason: String,
    },

    #[error("Unknown detector kind '{kind}'")]
    UnknownDetectorKind {
        kind: String,
    },

    #[error("Detector not found: {detector_id}")]
    DetectorNotFound {
        detector_id: DetectorId,
    },

    #[error("Invalid {component} configuration: {reason}")]
    InvalidSetting {
        component: &'static str,
        reason: String,
    },
}

/// Errors raised while turning a data packet into results.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Failed to extract value from packet: {reason}")]
    ValueExtraction {
        reason: String,
    },

    #[error("Failed to build evidence for group key {group_key:?}: {reason}")]
    Evidence {
        group_key: Option<String>,
        reason: String,
    },

    #[error("Runtime queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Runtime is disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Evaluation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Top-level error type for the detector engine.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Storage error during {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: StorageError,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl DetectorError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wraps a storage error with the operation that produced it.
    #[must_use]
    pub const fn storage(operation: &'static str, source: StorageError) -> Self {
        Self::Storage { operation, source }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }

    /// Returns true if the transport should redeliver the packet.
    ///
    /// Redelivery is safe for storage failures because dedupe makes a repeated
    /// pass converge to the same state.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Internal { .. } => false,
            Self::Evaluation(e) => matches!(
                e,
                EvaluationError::QueueFull { .. } | EvaluationError::Timeout { .. }
            ),
            Self::Storage { .. } => true,
        }
    }
}

/// Result type alias for engine operations.
pub type DetectorResult<T> = Result<T, DetectorError>;
