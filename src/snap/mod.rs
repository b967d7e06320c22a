//! Snapshot files on disk.
//!
//! Two kinds of files live in the snapshot directory:
//!
//! - `<term hex16>-<index hex16>.snap`: a checksummed snapshot record
//!   (metadata + state machine image), written when the server snapshots and
//!   when a snapshot message is persisted;
//! - `<index hex16>.snap.db`: a DB image received from the leader, staged
//!   here until the snapshot record is safely on disk, then renamed to the
//!   live DB. The rename-after-save order is what makes a crash recoverable.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::raft::Snapshot;

const SNAP_SUFFIX: &str = ".snap";
const DB_SUFFIX: &str = ".snap.db";

#[derive(Debug, thiserror::Error)]
pub enum SnapError {
    #[error("no available snapshot")]
    NoSnapshot,

    #[error("snapshot file {path:?} is corrupt")]
    Corrupt { path: PathBuf },

    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
}

/// The serialized `.snap` record. `checksum` covers the snapshot's data.
#[derive(Serialize, Deserialize)]
struct SnapRecord {
    checksum: String,
    snapshot: Snapshot,
}

fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Reads and writes snapshot files in a single directory.
#[derive(Debug, Clone)]
pub struct Snapshotter {
    dir: PathBuf,
}

impl Snapshotter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snap_path(&self, term: u64, index: u64) -> PathBuf {
        self.dir.join(format!("{:016x}-{:016x}{}", term, index, SNAP_SUFFIX))
    }

    fn db_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{:016x}{}", index, DB_SUFFIX))
    }

    /// Persist a snapshot record, fsynced before returning.
    pub fn save_snap(&self, snapshot: &Snapshot) -> Result<(), SnapError> {
        if snapshot.is_empty() {
            return Ok(());
        }
        let record = SnapRecord {
            checksum: hex_digest(&snapshot.data),
            snapshot: snapshot.clone(),
        };
        let path = self.snap_path(snapshot.metadata.term, snapshot.metadata.index);

        let mut f = std::fs::File::create(&path)?;
        f.write_all(&serde_json::to_vec(&record).expect("snapshot record serializes"))?;
        f.sync_all()?;

        tracing::info!(
            index = snapshot.metadata.index,
            term = snapshot.metadata.term,
            "saved snapshot to {:?}",
            path
        );
        Ok(())
    }

    /// Load the newest intact snapshot. Broken records are skipped with a
    /// warning so a torn write cannot brick the member.
    pub fn load(&self) -> Result<Snapshot, SnapError> {
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(SNAP_SUFFIX))
            .collect();
        names.sort();

        for name in names.iter().rev() {
            let path = self.dir.join(name);
            match self.read_record(&path) {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    tracing::warn!("skipping unreadable snapshot file {:?}: {}", path, e);
                }
            }
        }
        Err(SnapError::NoSnapshot)
    }

    fn read_record(&self, path: &Path) -> Result<Snapshot, SnapError> {
        let raw = std::fs::read(path)?;
        let record: SnapRecord = serde_json::from_slice(&raw).map_err(|_| SnapError::Corrupt {
            path: path.to_path_buf(),
        })?;
        if record.checksum != hex_digest(&record.snapshot.data) {
            return Err(SnapError::Corrupt {
                path: path.to_path_buf(),
            });
        }
        Ok(record.snapshot)
    }

    /// Stage a received DB image as `<index>.snap.db`. Returns bytes written.
    pub fn save_db_from(&self, data: &[u8], index: u64) -> Result<u64, SnapError> {
        let path = self.db_path(index);
        let mut f = std::fs::File::create(&path)?;
        f.write_all(data)?;
        f.sync_all()?;

        tracing::info!(index = index, bytes = data.len(), "saved database snapshot to {:?}", path);
        Ok(data.len() as u64)
    }

    /// The staged DB file for a snapshot index, if it was received.
    pub fn db_file_path(&self, index: u64) -> Result<PathBuf, SnapError> {
        let path = self.db_path(index);
        if path.exists() {
            Ok(path)
        } else {
            Err(SnapError::NoSnapshot)
        }
    }

    /// Drop staged DB images older than the released snapshot; they can no
    /// longer be claimed.
    pub fn release_snap_dbs(&self, snapshot: &Snapshot) -> Result<(), SnapError> {
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.ends_with(DB_SUFFIX) {
                continue;
            }
            let hex = &name[..name.len() - DB_SUFFIX.len()];
            match u64::from_str_radix(hex, 16) {
                Ok(index) if index < snapshot.metadata.index => {
                    tracing::info!("releasing obsolete database snapshot {:?}", entry.path());
                    if let Err(e) = std::fs::remove_file(entry.path()) {
                        tracing::warn!("failed to remove {:?}: {}", entry.path(), e);
                    }
                }
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("unexpected database snapshot file name {:?}", name);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::ConfState;
    use crate::raft::SnapshotMetadata;

    fn snap(term: u64, index: u64, data: &[u8]) -> Snapshot {
        Snapshot {
            metadata: SnapshotMetadata {
                term,
                index,
                conf_state: ConfState {
                    voters: vec![1],
                    learners: vec![],
                },
            },
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_save_then_load_newest() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let s = Snapshotter::new(dir.path());

        s.save_snap(&snap(1, 5, b"older"))?;
        s.save_snap(&snap(2, 9, b"newer"))?;

        let loaded = s.load()?;
        assert_eq!(9, loaded.metadata.index);
        assert_eq!(b"newer".to_vec(), loaded.data);
        Ok(())
    }

    #[test]
    fn test_load_skips_corrupt_record() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let s = Snapshotter::new(dir.path());

        s.save_snap(&snap(1, 5, b"good"))?;
        s.save_snap(&snap(1, 7, b"bad"))?;
        // Scribble over the newer record.
        let bad = dir.path().join(format!("{:016x}-{:016x}.snap", 1, 7));
        std::fs::write(&bad, b"not json")?;

        let loaded = s.load()?;
        assert_eq!(5, loaded.metadata.index);
        Ok(())
    }

    #[test]
    fn test_db_staging_and_release() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let s = Snapshotter::new(dir.path());

        s.save_db_from(b"old image", 3)?;
        s.save_db_from(b"new image", 8)?;
        assert!(s.db_file_path(3).is_ok());

        s.release_snap_dbs(&snap(1, 8, b""))?;
        assert!(s.db_file_path(3).is_err());
        assert!(s.db_file_path(8).is_ok());
        Ok(())
    }

    #[test]
    fn test_load_empty_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let s = Snapshotter::new(dir.path());
        assert!(matches!(s.load(), Err(SnapError::NoSnapshot)));
        Ok(())
    }
}
