//! Raft-side persistent storage: hard state + entries, and snapshot files.
//!
//! The raft node wrapper persists through this seam before messages that
//! refer to the persisted state leave the node. The trait order matters to
//! the snapshot ordering invariant: `save_snap` must be on disk before the
//! staged DB may be renamed, which the wrapper enforces by calling
//! `save_snap`, `save`, `sync` in that order and only then signalling the
//! applier.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;

use crate::errors::StorageError;
use crate::raft::Entry;
use crate::raft::HardState;
use crate::raft::Snapshot;
use crate::snap::Snapshotter;

pub trait PersistentStorage: Send + Sync + 'static {
    /// Persist hard state and entries.
    fn save(&self, hard_state: Option<&HardState>, entries: &[Entry]) -> Result<(), StorageError>;

    /// Persist a snapshot record.
    fn save_snap(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Flush everything saved so far to stable storage.
    fn sync(&self) -> Result<(), StorageError>;

    /// Release resources held for snapshots older than `snapshot`.
    fn release(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    fn close(&self) -> Result<(), StorageError>;
}

#[derive(Serialize)]
struct LogRecord<'a> {
    hard_state: Option<&'a HardState>,
    entries: &'a [Entry],
}

/// File-backed storage: an append-only log of save records next to the
/// snapshotter's directory.
pub struct FileStorage {
    log_path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
    snapshotter: Arc<Snapshotter>,
}

impl FileStorage {
    pub fn new(snapshotter: Arc<Snapshotter>) -> Result<Self, StorageError> {
        let log_path = snapshotter.dir().join("raft.log");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| StorageError::from_io(format!("open raft log {log_path:?}"), e))?;

        Ok(Self {
            log_path,
            file: Mutex::new(Some(file)),
            snapshotter,
        })
    }
}

impl PersistentStorage for FileStorage {
    fn save(&self, hard_state: Option<&HardState>, entries: &[Entry]) -> Result<(), StorageError> {
        if hard_state.is_none() && entries.is_empty() {
            return Ok(());
        }
        let mut guard = self.file.lock().unwrap();
        let Some(file) = guard.as_mut() else {
            return Err(StorageError::from_io(
                "raft log is closed",
                std::io::Error::from(std::io::ErrorKind::BrokenPipe),
            ));
        };

        let record = LogRecord { hard_state, entries };
        let mut line = serde_json::to_vec(&record).expect("log record serializes");
        line.push(b'\n');
        file.write_all(&line).map_err(|e| StorageError::from_io(format!("append {:?}", self.log_path), e))
    }

    fn save_snap(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.snapshotter.save_snap(snapshot).map_err(|e| StorageError::new("save snapshot", e))
    }

    fn sync(&self) -> Result<(), StorageError> {
        let guard = self.file.lock().unwrap();
        if let Some(file) = guard.as_ref() {
            file.sync_all().map_err(|e| StorageError::from_io(format!("sync {:?}", self.log_path), e))?;
        }
        Ok(())
    }

    fn release(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.snapshotter.release_snap_dbs(snapshot).map_err(|e| StorageError::new("release snapshots", e))
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut guard = self.file.lock().unwrap();
        if let Some(file) = guard.take() {
            file.sync_all().map_err(|e| StorageError::from_io(format!("close {:?}", self.log_path), e))?;
        }
        Ok(())
    }
}
