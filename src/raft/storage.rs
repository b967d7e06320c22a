//! In-memory raft log storage.
//!
//! The consensus module replicates out of this log; the snapshot coordinator
//! compacts it. Entries below the latest snapshot index are dropped, and a
//! dummy entry at the snapshot index anchors term lookups, so the log is
//! never empty.

use std::sync::RwLock;

use crate::raft::ConfState;
use crate::raft::Entry;
use crate::raft::HardState;
use crate::raft::Snapshot;
use crate::raft::SnapshotMetadata;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RaftLogError {
    /// The requested index predates the last compaction.
    #[error("requested index is unavailable due to compaction")]
    Compacted,

    /// The requested index is ahead of the last appended entry.
    #[error("requested entry at index is unavailable")]
    Unavailable,

    /// A snapshot is wanted but the log has none newer than what the
    /// requester already holds.
    #[error("snapshot is temporarily unavailable")]
    SnapshotTemporarilyUnavailable,
}

#[derive(Debug)]
struct LogCore {
    hard_state: HardState,
    snapshot_metadata: SnapshotMetadata,
    /// `entries[0]` is a dummy entry at the snapshot index.
    entries: Vec<Entry>,
}

impl LogCore {
    fn first_index(&self) -> u64 {
        self.entries[0].index + 1
    }

    fn last_index(&self) -> u64 {
        self.entries.last().unwrap().index
    }
}

/// Thread-safe in-memory raft log.
#[derive(Debug)]
pub struct MemRaftLog {
    core: RwLock<LogCore>,
}

impl Default for MemRaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemRaftLog {
    pub fn new() -> Self {
        Self {
            core: RwLock::new(LogCore {
                hard_state: HardState::default(),
                snapshot_metadata: SnapshotMetadata::default(),
                entries: vec![Entry::default()],
            }),
        }
    }

    pub fn set_hard_state(&self, hs: HardState) {
        self.core.write().unwrap().hard_state = hs;
    }

    pub fn hard_state(&self) -> HardState {
        self.core.read().unwrap().hard_state
    }

    pub fn first_index(&self) -> u64 {
        self.core.read().unwrap().first_index()
    }

    pub fn last_index(&self) -> u64 {
        self.core.read().unwrap().last_index()
    }

    pub fn term(&self, index: u64) -> Result<u64, RaftLogError> {
        let core = self.core.read().unwrap();
        let offset = core.entries[0].index;
        if index < offset {
            return Err(RaftLogError::Compacted);
        }
        core.entries
            .get((index - offset) as usize)
            .map(|e| e.term)
            .ok_or(RaftLogError::Unavailable)
    }

    pub fn entries(&self, low: u64, high: u64) -> Result<Vec<Entry>, RaftLogError> {
        let core = self.core.read().unwrap();
        let offset = core.entries[0].index;
        if low <= offset {
            return Err(RaftLogError::Compacted);
        }
        if high > core.last_index() + 1 {
            return Err(RaftLogError::Unavailable);
        }
        let lo = (low - offset) as usize;
        let hi = (high - offset) as usize;
        Ok(core.entries[lo..hi].to_vec())
    }

    /// Append entries, overwriting any conflicting suffix.
    ///
    /// # Panics
    ///
    /// Panics on a gap between the stored log and `ents`, which indicates a
    /// broken consensus module.
    pub fn append(&self, ents: &[Entry]) {
        if ents.is_empty() {
            return;
        }
        let mut core = self.core.write().unwrap();

        let first = core.first_index();
        let (last_new, first_new) = (ents.last().unwrap().index, ents[0].index);
        if last_new < first {
            // All entries are already compacted away.
            return;
        }
        if first_new > core.last_index() + 1 {
            panic!(
                "missing log entries [last: {}, append at: {}]",
                core.last_index(),
                first_new
            );
        }

        // Skip the prefix that compaction already covers, then truncate the
        // conflicting suffix.
        let ents = &ents[first.saturating_sub(first_new) as usize..];
        let offset = core.entries[0].index;
        core.entries.truncate((ents[0].index - offset) as usize);
        core.entries.extend_from_slice(ents);
    }

    /// Replace the log with a snapshot's position.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) {
        let mut core = self.core.write().unwrap();
        let meta = &snapshot.metadata;

        core.entries = vec![Entry {
            term: meta.term,
            index: meta.index,
            ..Entry::default()
        }];
        core.hard_state.term = core.hard_state.term.max(meta.term);
        core.hard_state.commit = meta.index;
        core.snapshot_metadata = meta.clone();
    }

    /// Materialize a snapshot record at `index` with the given configuration
    /// and state machine image.
    pub fn create_snapshot(
        &self,
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> Result<Snapshot, RaftLogError> {
        let mut core = self.core.write().unwrap();
        if index <= core.snapshot_metadata.index {
            return Err(RaftLogError::SnapshotTemporarilyUnavailable);
        }
        if index > core.last_index() {
            return Err(RaftLogError::Unavailable);
        }

        let offset = core.entries[0].index;
        let term = core.entries[(index - offset) as usize].term;
        core.snapshot_metadata = SnapshotMetadata {
            index,
            term,
            conf_state: conf_state.clone(),
        };

        Ok(Snapshot {
            metadata: core.snapshot_metadata.clone(),
            data,
        })
    }

    /// Drop entries up to and including `compact_index`.
    pub fn compact(&self, compact_index: u64) -> Result<(), RaftLogError> {
        let mut core = self.core.write().unwrap();
        let offset = core.entries[0].index;
        if compact_index <= offset {
            return Err(RaftLogError::Compacted);
        }
        if compact_index > core.last_index() {
            return Err(RaftLogError::Unavailable);
        }
        core.entries.drain(..(compact_index - offset) as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::EntryKind;

    fn ent(term: u64, index: u64) -> Entry {
        Entry {
            term,
            index,
            kind: EntryKind::Normal,
            data: Vec::new(),
        }
    }

    #[test]
    fn test_append_and_read() -> anyhow::Result<()> {
        let log = MemRaftLog::new();
        log.append(&[ent(1, 1), ent(1, 2), ent(2, 3)]);

        assert_eq!(1, log.first_index());
        assert_eq!(3, log.last_index());
        assert_eq!(2, log.term(3)?);
        assert_eq!(vec![ent(1, 2), ent(2, 3)], log.entries(2, 4)?);
        Ok(())
    }

    #[test]
    fn test_append_overwrites_conflict() -> anyhow::Result<()> {
        let log = MemRaftLog::new();
        log.append(&[ent(1, 1), ent(1, 2), ent(1, 3)]);
        log.append(&[ent(2, 2)]);

        assert_eq!(2, log.last_index());
        assert_eq!(2, log.term(2)?);
        Ok(())
    }

    #[test]
    fn test_compact_moves_first_index() -> anyhow::Result<()> {
        let log = MemRaftLog::new();
        log.append(&[ent(1, 1), ent(1, 2), ent(1, 3), ent(1, 4)]);
        log.compact(3)?;

        assert_eq!(4, log.first_index());
        assert_eq!(Err(RaftLogError::Compacted), log.entries(2, 4));
        assert_eq!(Err(RaftLogError::Compacted), log.compact(2));
        Ok(())
    }

    #[test]
    fn test_create_snapshot_then_apply() -> anyhow::Result<()> {
        let log = MemRaftLog::new();
        log.append(&[ent(1, 1), ent(2, 2)]);

        let cs = ConfState {
            voters: vec![1, 2],
            learners: vec![],
        };
        let snap = log.create_snapshot(2, cs.clone(), b"img".to_vec())?;
        assert_eq!(2, snap.metadata.index);
        assert_eq!(2, snap.metadata.term);
        assert_eq!(cs, snap.metadata.conf_state);

        let other = MemRaftLog::new();
        other.apply_snapshot(&snap);
        assert_eq!(3, other.first_index());
        assert_eq!(2, other.last_index());
        assert_eq!(2, other.hard_state().commit);
        Ok(())
    }
}
