//! Detector state manager.
//!
//! The only component that reads or writes detector state. Reads are batched
//! per packet (one durable query plus one pipelined counter read); writes are
//! staged in memory and flushed by `commit_state_updates` in two phases.
//!
//! There is no locking across stores. Two packets for the same group key
//! processed concurrently race last-write-wins on the counter store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::detector::DetectorId;
use crate::error::ConfigError;
use crate::packet::GroupKey;
use crate::priority::PriorityLevel;
use crate::storage::{CounterStore, CounterWrite, DetectorStateRow, DetectorStateStore, StorageError};

/// Counter TTL: seven days.
pub const DEFAULT_COUNTER_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Key suffix of the dedupe value.
pub const DEDUPE_SUFFIX: &str = "dedupe_value";

/// Staged or loaded threshold counters. `None` means unset.
pub type CounterMap = BTreeMap<PriorityLevel, Option<i64>>;

/// State manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateManagerConfig {
    /// Expiry of dedupe values and counters in the counter store.
    pub counter_ttl_seconds: u64,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            counter_ttl_seconds: DEFAULT_COUNTER_TTL_SECONDS,
        }
    }
}

impl StateManagerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `InvalidSetting` when the TTL is zero.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.counter_ttl_seconds == 0 {
            return Err(ConfigError::InvalidSetting {
                component: "state_manager",
                reason: "counter_ttl_seconds must be at least 1".to_string(),
            });
        }
        Ok(self)
    }
}

/// Working state of one `(detector, group_key)`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorStateData {
    pub group_key: GroupKey,
    pub is_triggered: bool,
    pub status: PriorityLevel,
    /// Last processed dedupe value; 0 when never seen or evicted.
    pub dedupe_value: u64,
    pub counter_updates: CounterMap,
}

impl DetectorStateData {
    /// Current count for `level`, treating unset as zero.
    #[must_use]
    pub fn count(&self, level: PriorityLevel) -> i64 {
        self.counter_updates.get(&level).copied().flatten().unwrap_or(0)
    }

    /// True when any counter holds a non-zero value.
    #[must_use]
    pub fn has_partial_counts(&self) -> bool {
        self.counter_updates
            .values()
            .any(|v| v.is_some_and(|n| n != 0))
    }
}

/// What a commit wrote.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitSummary {
    pub counter_writes: usize,
    pub rows_created: usize,
    pub rows_updated: usize,
}

/// Batches detector state reads and writes for one detector.
pub struct DetectorStateManager {
    detector_id: DetectorId,
    counter_names: Vec<PriorityLevel>,
    config: StateManagerConfig,
    counters: Arc<dyn CounterStore>,
    states: Arc<dyn DetectorStateStore>,
    dedupe_updates: HashMap<GroupKey, u64>,
    counter_updates: HashMap<GroupKey, CounterMap>,
    state_updates: HashMap<GroupKey, (bool, PriorityLevel)>,
}

impl DetectorStateManager {
    /// Create a manager tracking one counter per entry of `counter_names`.
    #[must_use]
    pub fn new(
        detector_id: DetectorId,
        counter_names: Vec<PriorityLevel>,
        config: StateManagerConfig,
        counters: Arc<dyn CounterStore>,
        states: Arc<dyn DetectorStateStore>,
    ) -> Self {
        Self {
            detector_id,
            counter_names,
            config,
            counters,
            states,
            dedupe_updates: HashMap::new(),
            counter_updates: HashMap::new(),
            state_updates: HashMap::new(),
        }
    }

    /// Counters tracked per group key.
    #[must_use]
    pub fn counter_names(&self) -> &[PriorityLevel] {
        &self.counter_names
    }

    /// Counter store key for `group_key`.
    ///
    /// `detector:<detector_id>:<group_key or empty>[:<suffix>]`. Stable across
    /// restarts so re-reads stay idempotent.
    #[must_use]
    pub fn build_key(&self, group_key: &GroupKey, suffix: Option<&str>) -> String {
        let group = group_key.as_deref().unwrap_or("");
        match suffix {
            Some(suffix) => format!("detector:{}:{group}:{suffix}", self.detector_id),
            None => format!("detector:{}:{group}", self.detector_id),
        }
    }

    fn dedupe_key(&self, group_key: &GroupKey) -> String {
        self.build_key(group_key, Some(DEDUPE_SUFFIX))
    }

    fn counter_key(&self, group_key: &GroupKey, level: PriorityLevel) -> String {
        self.build_key(group_key, Some(level.as_str()))
    }

    /// Load state for a batch of group keys.
    ///
    /// Missing durable rows read as untriggered `Ok`; missing counter-store
    /// values read as dedupe 0 and unset counters.
    ///
    /// # Errors
    /// Propagates storage errors from either store.
    pub fn get_state_data(
        &self,
        group_keys: &[GroupKey],
    ) -> Result<HashMap<GroupKey, DetectorStateData>, StorageError> {
        let mut seen = HashSet::new();
        let group_keys: Vec<GroupKey> = group_keys
            .iter()
            .filter(|gk| seen.insert((*gk).clone()))
            .cloned()
            .collect();
        if group_keys.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: HashMap<GroupKey, DetectorStateRow> = self
            .states
            .find_by_group_keys(self.detector_id, &group_keys)?
            .into_iter()
            .map(|row| (row.group_key.clone(), row))
            .collect();

        let per_key = 1 + self.counter_names.len();
        let mut keys = Vec::with_capacity(group_keys.len() * per_key);
        for gk in &group_keys {
            keys.push(self.dedupe_key(gk));
            for level in &self.counter_names {
                keys.push(self.counter_key(gk, *level));
            }
        }
        let values = self.counters.get_many(&keys)?;
        if values.len() != keys.len() {
            return Err(StorageError::BackendError(format!(
                "counter store returned {} values for {} keys",
                values.len(),
                keys.len()
            )));
        }

        let mut out = HashMap::with_capacity(group_keys.len());
        for (gk, chunk) in group_keys.into_iter().zip(values.chunks(per_key)) {
            let dedupe_value = chunk[0]
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(0);
            let counter_updates: CounterMap = self
                .counter_names
                .iter()
                .copied()
                .zip(chunk[1..].iter().copied())
                .collect();
            let (is_triggered, status) = rows
                .get(&gk)
                .map_or((false, PriorityLevel::Ok), |row| (row.is_triggered, row.status));
            out.insert(
                gk.clone(),
                DetectorStateData {
                    group_key: gk,
                    is_triggered,
                    status,
                    dedupe_value,
                    counter_updates,
                },
            );
        }
        Ok(out)
    }

    /// Stage a new dedupe value.
    pub fn enqueue_dedupe_update(&mut self, group_key: GroupKey, dedupe_value: u64) {
        self.dedupe_updates.insert(group_key, dedupe_value);
    }

    /// Stage counter values, merging with anything already staged.
    pub fn enqueue_counter_update(&mut self, group_key: GroupKey, updates: CounterMap) {
        self.counter_updates.entry(group_key).or_default().extend(updates);
    }

    /// Stage every tracked counter as unset.
    pub fn enqueue_counter_reset(&mut self, group_key: GroupKey) {
        let reset: CounterMap = self.counter_names.iter().map(|l| (*l, None)).collect();
        self.counter_updates.insert(group_key, reset);
    }

    /// Stage a durable state change.
    pub fn enqueue_state_update(&mut self, group_key: GroupKey, is_triggered: bool, status: PriorityLevel) {
        self.state_updates.insert(group_key, (is_triggered, status));
    }

    /// True when nothing is staged.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.dedupe_updates.is_empty() && self.counter_updates.is_empty() && self.state_updates.is_empty()
    }

    /// Flush everything staged.
    ///
    /// Phase one is a single pipelined counter-store write; phase two is one
    /// bulk create plus one bulk update against the durable store, skipping
    /// rows whose state did not change. Staged updates are cleared even when
    /// a phase fails.
    ///
    /// # Errors
    /// Propagates the first storage error. Phase one is not rolled back when
    /// phase two fails.
    pub fn commit_state_updates(&mut self) -> Result<CommitSummary, StorageError> {
        let dedupe_updates = std::mem::take(&mut self.dedupe_updates);
        let counter_updates = std::mem::take(&mut self.counter_updates);
        let state_updates = std::mem::take(&mut self.state_updates);

        let mut summary = CommitSummary::default();
        let ttl_seconds = self.config.counter_ttl_seconds;

        let mut writes = Vec::with_capacity(dedupe_updates.len() + counter_updates.len());
        for (gk, value) in &dedupe_updates {
            let value = i64::try_from(*value).map_err(|_| {
                StorageError::SerializationError(format!("dedupe value {value} does not fit the counter store"))
            })?;
            writes.push(CounterWrite::Set {
                key: self.dedupe_key(gk),
                value,
                ttl_seconds,
            });
        }
        for (gk, counters) in &counter_updates {
            for (level, value) in counters {
                let key = self.counter_key(gk, *level);
                writes.push(match value {
                    Some(value) => CounterWrite::Set {
                        key,
                        value: *value,
                        ttl_seconds,
                    },
                    None => CounterWrite::Delete { key },
                });
            }
        }
        if !writes.is_empty() {
            self.counters.write_many(&writes)?;
            summary.counter_writes = writes.len();
        }

        if state_updates.is_empty() {
            return Ok(summary);
        }

        let group_keys: Vec<GroupKey> = state_updates.keys().cloned().collect();
        let existing: HashMap<GroupKey, DetectorStateRow> = self
            .states
            .find_by_group_keys(self.detector_id, &group_keys)?
            .into_iter()
            .map(|row| (row.group_key.clone(), row))
            .collect();

        let mut to_create = Vec::new();
        let mut to_update = Vec::new();
        for (gk, (is_triggered, status)) in state_updates {
            match existing.get(&gk) {
                None => to_create.push(DetectorStateRow::new(self.detector_id, gk, is_triggered, status)),
                Some(row) if row.is_triggered != is_triggered || row.status != status => {
                    to_update.push(DetectorStateRow::new(self.detector_id, gk, is_triggered, status));
                }
                Some(_) => {}
            }
        }

        if !to_create.is_empty() {
            summary.rows_created = to_create.len();
            self.states.bulk_create(to_create)?;
        }
        if !to_update.is_empty() {
            summary.rows_updated = to_update.len();
            self.states.bulk_update(to_update)?;
        }

        debug!(
            detector_id = %self.detector_id,
            counter_writes = summary.counter_writes,
            rows_created = summary.rows_created,
            rows_updated = summary.rows_updated,
            "committed detector state"
        );
        Ok(summary)
    }
}
