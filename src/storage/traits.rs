//! Abstract storage traits for detector state.
//!
//! Detector state is split across two stores:
//! - a fast ephemeral counter store (Redis-like) holding dedupe values and
//!   threshold counters with a TTL
//! - a durable relational store holding the last known `(is_triggered, status)`
//!   per `(detector, group_key)`
//!
//! Both are shared, externally synchronized resources. Implementations must
//! be safe for concurrent use from many workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detector::DetectorId;
use crate::packet::GroupKey;
use crate::priority::PriorityLevel;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Row already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Row expected to exist is missing.
    #[error("Row not found: {0}")]
    RowNotFound(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// One staged write against the counter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterWrite {
    /// `SET key value EX ttl_seconds`
    Set {
        /// Key to write.
        key: String,
        /// New value.
        value: i64,
        /// Expiry in seconds.
        ttl_seconds: u64,
    },
    /// `DEL key`
    Delete {
        /// Key to remove.
        key: String,
    },
}

impl CounterWrite {
    /// Key touched by this write.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Ephemeral keyed counter store.
///
/// Both operations are a single pipelined round trip. Writes are plain
/// `SET`/`DEL`, never compare-and-swap.
pub trait CounterStore: Send + Sync {
    /// Read `keys`, returning one entry per key in order. Missing or expired
    /// keys read as `None`.
    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>, StorageError>;

    /// Apply `writes` in order.
    fn write_many(&self, writes: &[CounterWrite]) -> Result<(), StorageError>;
}

/// Durable per-group-key detector state.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorStateRow {
    pub detector_id: DetectorId,
    pub group_key: GroupKey,
    pub is_triggered: bool,
    pub status: PriorityLevel,
    pub updated_at: DateTime<Utc>,
}

impl DetectorStateRow {
    #[must_use]
    pub fn new(
        detector_id: DetectorId,
        group_key: GroupKey,
        is_triggered: bool,
        status: PriorityLevel,
    ) -> Self {
        Self {
            detector_id,
            group_key,
            is_triggered,
            status,
            updated_at: Utc::now(),
        }
    }

    /// Human-readable row key used in error messages.
    #[must_use]
    pub fn describe_key(&self) -> String {
        format!(
            "detector={} group_key={}",
            self.detector_id,
            self.group_key.as_deref().unwrap_or("<none>")
        )
    }
}

/// Durable store of `(is_triggered, status)` keyed by `(detector, group_key)`.
pub trait DetectorStateStore: Send + Sync {
    /// Bulk read of the rows for `group_keys`. The `None` key matches rows
    /// with no group key. Keys without a row are simply absent.
    fn find_by_group_keys(
        &self,
        detector_id: DetectorId,
        group_keys: &[GroupKey],
    ) -> Result<Vec<DetectorStateRow>, StorageError>;

    /// Insert new rows. Fails without writing if any row already exists.
    fn bulk_create(&self, rows: Vec<DetectorStateRow>) -> Result<(), StorageError>;

    /// Update `is_triggered`, `status` and `updated_at` of existing rows.
    /// Fails without writing if any row is missing.
    fn bulk_update(&self, rows: Vec<DetectorStateRow>) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_counter_store_object_safe(_: &dyn CounterStore) {}
    fn _assert_state_store_object_safe(_: &dyn DetectorStateStore) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::RowNotFound("detector=1".to_string());
        assert!(err.to_string().contains("Row not found"));

        let err = StorageError::BackendError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_describe_key_handles_none() {
        let row = DetectorStateRow::new(DetectorId(7), None, false, PriorityLevel::Ok);
        assert_eq!(row.describe_key(), "detector=7 group_key=<none>");
    }
}
