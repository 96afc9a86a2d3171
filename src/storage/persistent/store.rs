//! Write-ahead-logged `DetectorStateStore`.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, info, warn};

use crate::detector::DetectorId;
use crate::error::{DetectorError, DetectorResult};
use crate::packet::GroupKey;
use crate::storage::traits::{DetectorStateRow, DetectorStateStore, StorageError};

use super::file_lock::FileLock;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "state.wal";

type RowKey = (DetectorId, GroupKey);
type Rows = HashMap<RowKey, DetectorStateRow>;

fn row_key(row: &DetectorStateRow) -> RowKey {
    (row.detector_id, row.group_key.clone())
}

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn io_err(context: &'static str, e: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {e}"))
}

/// What a compaction did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionResult {
    /// Rows written to the snapshot.
    pub rows: usize,
    pub wal_size_before: u64,
    pub wal_size_after: u64,
}

/// Durable detector state in a locked directory.
#[derive(Debug)]
pub struct PersistentDetectorStateStore {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    config: PersistentConfig,
    rows: RwLock<Rows>,
}

impl PersistentDetectorStateStore {
    /// Open or create the store in `dir` and replay its log.
    ///
    /// # Errors
    /// Invalid configuration, a directory already locked by another handle,
    /// or a corrupt log.
    pub fn open(dir: impl AsRef<Path>, config: PersistentConfig) -> DetectorResult<Self> {
        let config = config.validate()?;
        let dir = dir.as_ref();
        let open_err = |context, e: std::io::Error| DetectorError::storage("persistent.open", io_err(context, &e));

        fs::create_dir_all(dir).map_err(|e| open_err("create directory", e))?;
        let lock = FileLock::acquire(dir).map_err(|e| open_err("acquire lock", e))?;
        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| open_err("open WAL", e))?;

        let rows = replay(&wal).map_err(|e| DetectorError::storage("persistent.replay", e))?;
        info!(dir = %dir.display(), rows = rows.len(), "opened detector state store");

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            config,
            rows: RwLock::new(rows),
        })
    }

    /// Directory holding the log and lock.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of stored rows.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.rows.read().map_err(|_| lock_err("persistent.len"))?.len())
    }

    /// True when no rows are stored.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Current log size in bytes.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        self.wal.size_bytes().map_err(|e| io_err("wal size", &e))
    }

    /// Rewrite the log as one snapshot of the current rows.
    ///
    /// # Errors
    /// I/O failures. The previous log stays intact when compaction fails.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let rows = self.rows.write().map_err(|_| lock_err("persistent.compact"))?;
        self.compact_locked(&rows)
    }

    fn compact_locked(&self, rows: &Rows) -> Result<CompactionResult, StorageError> {
        let wal_size_before = self.wal_size()?;
        let mut snapshot: Vec<DetectorStateRow> = rows.values().cloned().collect();
        snapshot.sort_by(|a, b| row_key(a).cmp(&row_key(b)));
        let count = snapshot.len();

        self.wal
            .replace_with_snapshot(snapshot)
            .map_err(|e| io_err("compact WAL", &e))?;
        let result = CompactionResult {
            rows: count,
            wal_size_before,
            wal_size_after: self.wal_size()?,
        };
        debug!(
            rows = result.rows,
            wal_size_before = result.wal_size_before,
            wal_size_after = result.wal_size_after,
            "compacted detector state log"
        );
        Ok(result)
    }

    /// Compact once the log outgrows `max_wal_size`. Runs after a write has
    /// been logged, so failures are reported and never fail that write.
    fn maybe_compact(&self, rows: &Rows) {
        let result = match self.wal_size() {
            Ok(size) if size > self.config.max_wal_size => self.compact_locked(rows).map(|_| ()),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(dir = %self.dir.display(), error = %e, "detector state log compaction failed");
        }
    }
}

fn replay(wal: &WriteAheadLog) -> Result<Rows, StorageError> {
    let mut rows = Rows::new();
    let mut entries = 0u64;
    for entry in wal.iter().map_err(|e| io_err("read WAL", &e))? {
        let entry = entry.map_err(|e| StorageError::SerializationError(format!("corrupt WAL entry: {e}")))?;
        match entry.kind {
            WalEntryKind::Snapshot(snapshot) => {
                rows.clear();
                rows.extend(snapshot.into_iter().map(|row| (row_key(&row), row)));
            }
            WalEntryKind::Create(batch) | WalEntryKind::Update(batch) => {
                rows.extend(batch.into_iter().map(|row| (row_key(&row), row)));
            }
        }
        entries += 1;
    }
    if entries > 0 {
        debug!(entries, rows = rows.len(), "replayed detector state log");
    }
    Ok(rows)
}

impl DetectorStateStore for PersistentDetectorStateStore {
    fn find_by_group_keys(
        &self,
        detector_id: DetectorId,
        group_keys: &[GroupKey],
    ) -> Result<Vec<DetectorStateRow>, StorageError> {
        let rows = self.rows.read().map_err(|_| lock_err("persistent.find_by_group_keys"))?;
        Ok(group_keys
            .iter()
            .filter_map(|gk| rows.get(&(detector_id, gk.clone())).cloned())
            .collect())
    }

    fn bulk_create(&self, new_rows: Vec<DetectorStateRow>) -> Result<(), StorageError> {
        if new_rows.is_empty() {
            return Ok(());
        }
        let mut rows = self.rows.write().map_err(|_| lock_err("persistent.bulk_create"))?;
        let mut batch = HashSet::with_capacity(new_rows.len());
        if let Some(dup) = new_rows
            .iter()
            .find(|r| rows.contains_key(&row_key(r)) || !batch.insert(row_key(r)))
        {
            return Err(StorageError::DuplicateKey(dup.describe_key()));
        }

        self.wal
            .append(WalEntryKind::Create(new_rows.clone()))
            .map_err(|e| io_err("append WAL", &e))?;
        rows.extend(new_rows.into_iter().map(|row| (row_key(&row), row)));
        self.maybe_compact(&rows);
        Ok(())
    }

    fn bulk_update(&self, updates: Vec<DetectorStateRow>) -> Result<(), StorageError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut rows = self.rows.write().map_err(|_| lock_err("persistent.bulk_update"))?;
        if let Some(missing) = updates.iter().find(|r| !rows.contains_key(&row_key(r))) {
            return Err(StorageError::RowNotFound(missing.describe_key()));
        }

        self.wal
            .append(WalEntryKind::Update(updates.clone()))
            .map_err(|e| io_err("append WAL", &e))?;
        rows.extend(updates.into_iter().map(|row| (row_key(&row), row)));
        self.maybe_compact(&rows);
        Ok(())
    }
}
