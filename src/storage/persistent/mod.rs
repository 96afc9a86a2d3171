//! Crash-safe durable detector state.
//!
//! Rows live in memory and every mutation is written ahead to a log:
//!
//! ```text
//! <dir>/LOCK        exclusive process lock
//! <dir>/state.wal   [header][snapshot?][create|update]*
//! ```
//!
//! Opening a directory replays the log. Once the log grows past
//! `max_wal_size` it is compacted into a single snapshot entry.

mod codec;
mod file_lock;
mod store;
mod wal;

pub use file_lock::FileLock;
pub use store::{CompactionResult, PersistentDetectorStateStore};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use crate::error::ConfigError;

/// Durable store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentConfig {
    /// Log size in bytes that triggers compaction after a write.
    pub max_wal_size: u64,
    /// fsync after every append.
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 16 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    /// Smaller logs would compact on nearly every write.
    pub const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `InvalidSetting` when `max_wal_size` is below `MIN_WAL_SIZE`.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ConfigError::InvalidSetting {
                component: "persistent_store",
                reason: format!(
                    "max_wal_size must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}
