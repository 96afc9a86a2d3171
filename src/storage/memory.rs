//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};

use crate::detector::DetectorId;
use crate::packet::GroupKey;
use crate::storage::traits::{
    CounterStore, CounterWrite, DetectorStateRow, DetectorStateStore, StorageError,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: i64,
    expires_at: DateTime<Utc>,
}

impl CounterEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Thread-safe in-memory counter store with TTL expiry.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    entries: RwLock<HashMap<String, CounterEntry>>,
}

impl InMemoryCounterStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a single key.
    pub fn get(&self, key: &str) -> Result<Option<i64>, StorageError> {
        Ok(self.get_many(&[key.to_string()])?.pop().flatten())
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize, StorageError> {
        let now = Utc::now();
        let entries = self.entries.read().map_err(|_| lock_err("counter.len"))?;
        Ok(entries.values().filter(|e| e.is_live(now)).count())
    }

    /// True when no live keys remain.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Drop every key, as a cache eviction would.
    pub fn evict_all(&self) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| lock_err("counter.evict_all"))?;
        entries.clear();
        Ok(())
    }
}

impl CounterStore for InMemoryCounterStore {
    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>, StorageError> {
        let now = Utc::now();
        let entries = self.entries.read().map_err(|_| lock_err("counter.get_many"))?;
        Ok(keys
            .iter()
            .map(|key| {
                entries
                    .get(key)
                    .filter(|e| e.is_live(now))
                    .map(|e| e.value)
            })
            .collect())
    }

    fn write_many(&self, writes: &[CounterWrite]) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut entries = self.entries.write().map_err(|_| lock_err("counter.write_many"))?;
        for write in writes {
            match write {
                CounterWrite::Set {
                    key,
                    value,
                    ttl_seconds,
                } => {
                    let ttl = i64::try_from(*ttl_seconds).unwrap_or(i64::MAX);
                    let expires_at = Duration::try_seconds(ttl)
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    entries.insert(
                        key.clone(),
                        CounterEntry {
                            value: *value,
                            expires_at,
                        },
                    );
                }
                CounterWrite::Delete { key } => {
                    entries.remove(key);
                }
            }
        }
        entries.retain(|_, e| e.is_live(now));
        Ok(())
    }
}

type RowKey = (DetectorId, GroupKey);

fn row_key(row: &DetectorStateRow) -> RowKey {
    (row.detector_id, row.group_key.clone())
}

/// Thread-safe in-memory durable state store.
#[derive(Debug, Default)]
pub struct InMemoryDetectorStateStore {
    rows: RwLock<HashMap<RowKey, DetectorStateRow>>,
}

impl InMemoryDetectorStateStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch one row.
    pub fn get(
        &self,
        detector_id: DetectorId,
        group_key: &GroupKey,
    ) -> Result<Option<DetectorStateRow>, StorageError> {
        let rows = self.rows.read().map_err(|_| lock_err("state.get"))?;
        Ok(rows.get(&(detector_id, group_key.clone())).cloned())
    }

    /// Number of stored rows.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.rows.read().map_err(|_| lock_err("state.len"))?.len())
    }

    /// True when no rows are stored.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl DetectorStateStore for InMemoryDetectorStateStore {
    fn find_by_group_keys(
        &self,
        detector_id: DetectorId,
        group_keys: &[GroupKey],
    ) -> Result<Vec<DetectorStateRow>, StorageError> {
        let rows = self.rows.read().map_err(|_| lock_err("state.find_by_group_keys"))?;
        Ok(group_keys
            .iter()
            .filter_map(|gk| rows.get(&(detector_id, gk.clone())).cloned())
            .collect())
    }

    fn bulk_create(&self, new_rows: Vec<DetectorStateRow>) -> Result<(), StorageError> {
        let mut rows = self.rows.write().map_err(|_| lock_err("state.bulk_create"))?;
        if let Some(existing) = new_rows.iter().find(|r| rows.contains_key(&row_key(r))) {
            return Err(StorageError::DuplicateKey(existing.describe_key()));
        }
        for row in new_rows {
            rows.insert(row_key(&row), row);
        }
        Ok(())
    }

    fn bulk_update(&self, updates: Vec<DetectorStateRow>) -> Result<(), StorageError> {
        let mut rows = self.rows.write().map_err(|_| lock_err("state.bulk_update"))?;
        if let Some(missing) = updates.iter().find(|r| !rows.contains_key(&row_key(r))) {
            return Err(StorageError::RowNotFound(missing.describe_key()));
        }
        for row in updates {
            rows.insert(row_key(&row), row);
        }
        Ok(())
    }
}

/// Convenience bundle of in-memory stores.
#[derive(Debug, Default)]
pub struct InMemoryStores {
    /// Ephemeral counters.
    pub counters: InMemoryCounterStore,
    /// Durable state rows.
    pub states: InMemoryDetectorStateStore,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::PriorityLevel;

    fn set(key: &str, value: i64) -> CounterWrite {
        CounterWrite::Set {
            key: key.to_string(),
            value,
            ttl_seconds: 60,
        }
    }

    #[test]
    fn counter_get_many_preserves_order() {
        let store = InMemoryCounterStore::new();
        store.write_many(&[set("a", 1), set("c", 3)]).unwrap();
        let got = store
            .get_many(&["c".to_string(), "b".to_string(), "a".to_string()])
            .unwrap();
        assert_eq!(got, vec![Some(3), None, Some(1)]);
    }

    #[test]
    fn counter_delete_and_overwrite() {
        let store = InMemoryCounterStore::new();
        store.write_many(&[set("a", 1), set("a", 2)]).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(2));
        store
            .write_many(&[CounterWrite::Delete {
                key: "a".to_string(),
            }])
            .unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn counter_expired_keys_read_as_missing() {
        let store = InMemoryCounterStore::new();
        store
            .write_many(&[CounterWrite::Set {
                key: "gone".to_string(),
                value: 9,
                ttl_seconds: 0,
            }])
            .unwrap();
        assert_eq!(store.get("gone").unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn counter_evict_all() {
        let store = InMemoryCounterStore::new();
        store.write_many(&[set("a", 1), set("b", 2)]).unwrap();
        assert_eq!(store.len().unwrap(), 2);
        store.evict_all().unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn state_find_handles_none_key() {
        let store = InMemoryDetectorStateStore::new();
        let d = DetectorId(1);
        store
            .bulk_create(vec![
                DetectorStateRow::new(d, None, true, PriorityLevel::High),
                DetectorStateRow::new(d, Some("a".to_string()), false, PriorityLevel::Ok),
                DetectorStateRow::new(DetectorId(2), None, false, PriorityLevel::Ok),
            ])
            .unwrap();

        let rows = store
            .find_by_group_keys(d, &[None, Some("missing".to_string())])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, PriorityLevel::High);
    }

    #[test]
    fn state_bulk_create_rejects_duplicates_atomically() {
        let store = InMemoryDetectorStateStore::new();
        let d = DetectorId(1);
        store
            .bulk_create(vec![DetectorStateRow::new(d, None, false, PriorityLevel::Ok)])
            .unwrap();

        let err = store
            .bulk_create(vec![
                DetectorStateRow::new(d, Some("new".to_string()), false, PriorityLevel::Ok),
                DetectorStateRow::new(d, None, true, PriorityLevel::High),
            ])
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn state_bulk_update_requires_existing_rows() {
        let store = InMemoryDetectorStateStore::new();
        let d = DetectorId(1);
        let err = store
            .bulk_update(vec![DetectorStateRow::new(d, None, true, PriorityLevel::High)])
            .unwrap_err();
        assert!(matches!(err, StorageError::RowNotFound(_)));

        store
            .bulk_create(vec![DetectorStateRow::new(d, None, false, PriorityLevel::Ok)])
            .unwrap();
        store
            .bulk_update(vec![DetectorStateRow::new(d, None, true, PriorityLevel::High)])
            .unwrap();
        let row = store.get(d, &None).unwrap().unwrap();
        assert!(row.is_triggered);
        assert_eq!(row.status, PriorityLevel::High);
    }
}
