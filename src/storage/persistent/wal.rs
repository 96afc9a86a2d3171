//! Write-ahead log of detector state mutations.
//!
//! Every bulk create or update is appended (and optionally fsynced) before it
//! is applied in memory. Opening a store replays the log. Compaction replaces
//! the whole log with one snapshot entry via write-to-temp and rename.
//!
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [frame: WalEntry]
//! [frame: WalEntry]
//! ...
//! ```
//!
//! A frame torn by a crash mid-append is cut off when the log is reopened; a
//! checksum failure is an error.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::traits::DetectorStateRow;

use super::codec;

/// One log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Position in the current log, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: WalEntryKind,
}

/// Logged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "rows", rename_all = "snake_case")]
pub enum WalEntryKind {
    /// Full state as of compaction. Replaces everything replayed before it.
    Snapshot(Vec<DetectorStateRow>),
    Create(Vec<DetectorStateRow>),
    Update(Vec<DetectorStateRow>),
}

fn poisoned(context: &str) -> IoError {
    IoError::new(ErrorKind::Other, format!("poisoned lock: {context}"))
}

/// Append-only log file. Thread-safe.
#[derive(Debug)]
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    sequence: Mutex<u64>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Open the log at `path`, creating it with a header if absent.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let has_header = fs::metadata(path).map(|m| m.len() >= 5).unwrap_or(false);
        let sequence = if has_header {
            let (last, valid_len) = Self::scan(path)?;
            let file_len = fs::metadata(path)?.len();
            if valid_len < file_len {
                warn!(path = %path.display(), valid_len, file_len, "truncating torn WAL tail");
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            last
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
            0
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
            sequence: Mutex::new(sequence),
            sync_on_write,
        })
    }

    fn lock_writer(&self) -> IoResult<MutexGuard<'_, BufWriter<File>>> {
        self.writer.lock().map_err(|_| poisoned("wal.writer"))
    }

    fn lock_sequence(&self) -> IoResult<MutexGuard<'_, u64>> {
        self.sequence.lock().map_err(|_| poisoned("wal.sequence"))
    }

    /// Append `kind`, returning its sequence.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.lock_writer()?;
        let mut sequence = self.lock_sequence()?;

        let next = *sequence + 1;
        let encoded = codec::encode(&WalEntry {
            sequence: next,
            timestamp: Utc::now(),
            kind,
        })?;
        writer.write_all(&encoded)?;
        writer.flush()?;
        if self.sync_on_write {
            writer.get_ref().sync_data()?;
        }
        *sequence = next;
        Ok(next)
    }

    /// Entries in log order.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence of the last appended entry; 0 for an empty log.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(*self.lock_sequence()?)
    }

    /// Log size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Atomically replace the log with a single `snapshot` entry.
    ///
    /// The new log is written and fsynced next to the old one, then renamed
    /// over it. A crash at any point leaves either the old or the new log.
    pub fn replace_with_snapshot(&self, rows: Vec<DetectorStateRow>) -> IoResult<()> {
        let mut writer = self.lock_writer()?;
        let mut sequence = self.lock_sequence()?;
        writer.flush()?;

        let tmp_path = self.path.with_extension("wal.compact");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            codec::write_header(&mut tmp)?;
            tmp.write_all(&codec::encode(&WalEntry {
                sequence: 1,
                timestamp: Utc::now(),
                kind: WalEntryKind::Snapshot(rows),
            })?)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }

        *writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        *sequence = 1;
        Ok(())
    }

    /// Last good sequence and the byte length of the readable prefix. The
    /// prefix stops short of the file end only for a torn final frame.
    fn scan(path: &Path) -> IoResult<(u64, u64)> {
        let mut iter = WalIterator::new(path)?;
        let file_size = iter.file_size;
        let mut last = 0;
        for entry in iter.by_ref() {
            match entry {
                Ok(entry) => last = entry.sequence,
                Err(e) => {
                    warn!(path = %path.display(), after_sequence = last, error = %e, "corrupt WAL entry");
                    return Ok((last, file_size));
                }
            }
        }
        Ok((last, iter.valid_len))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> IoResult<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> IoResult<()> {
    Ok(())
}

/// Iterator over log entries.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
    valid_len: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        let valid_len = reader.stream_position()?;
        Ok(Self {
            reader,
            file_size,
            valid_len,
        })
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.stream_position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }
        match codec::decode(&mut self.reader) {
            Ok(entry) => match self.reader.stream_position() {
                Ok(pos) => {
                    self.valid_len = pos;
                    Some(Ok(entry))
                }
                Err(e) => Some(Err(e)),
            },
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorId;
    use crate::priority::PriorityLevel;
    use tempfile::tempdir;

    fn row(group: &str) -> DetectorStateRow {
        DetectorStateRow::new(DetectorId(1), Some(group.to_string()), true, PriorityLevel::High)
    }

    #[test]
    fn append_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.wal");
        {
            let wal = WriteAheadLog::open(&path, true).unwrap();
            wal.append(WalEntryKind::Create(vec![row("a")])).unwrap();
            wal.append(WalEntryKind::Update(vec![row("a")])).unwrap();
        }
        let wal = WriteAheadLog::open(&path, true).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        let kinds: Vec<_> = wal.iter().unwrap().map(|e| e.unwrap().kind).collect();
        assert!(matches!(kinds[0], WalEntryKind::Create(_)));
        assert!(matches!(kinds[1], WalEntryKind::Update(_)));
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.wal");
        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            wal.append(WalEntryKind::Create(vec![row("a")])).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        let frame = codec::encode(&WalEntry {
            sequence: 2,
            timestamp: Utc::now(),
            kind: WalEntryKind::Create(vec![row("b")]),
        })
        .unwrap();
        file.write_all(&frame[..frame.len() / 2]).unwrap();
        drop(file);

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 1);
        wal.append(WalEntryKind::Create(vec![row("c")])).unwrap();
        let sequences: Vec<_> = wal.iter().unwrap().map(|e| e.unwrap().sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn snapshot_replaces_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.wal");
        let wal = WriteAheadLog::open(&path, false).unwrap();
        for _ in 0..10 {
            wal.append(WalEntryKind::Update(vec![row("a")])).unwrap();
        }
        let before = wal.size_bytes().unwrap();

        wal.replace_with_snapshot(vec![row("a")]).unwrap();
        assert!(wal.size_bytes().unwrap() < before);
        assert_eq!(wal.current_sequence().unwrap(), 1);

        wal.append(WalEntryKind::Create(vec![row("b")])).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].kind, WalEntryKind::Snapshot(_)));
        assert_eq!(entries[1].sequence, 2);
    }
}
