//! Snapshot coordination: cutting snapshots and installing received ones.

use std::sync::Arc;

use crate::raft::Message;
use crate::raft::RaftLogError;
use crate::raft::Snapshot;
use crate::raft::SnapshotMetadata;
use crate::raft::ToApply;
use crate::server::Progress;
use crate::server::Server;
use crate::storage;
use crate::storage::schema;
use crate::transport::SnapMessage;

impl Server {
    /// Decide whether the batch that just applied warrants a snapshot.
    ///
    /// A memory snapshot trims the in-memory raft log every
    /// `snapshot_count` applied entries; a disk snapshot is forced when the
    /// applied index has run `snapshot_catch_up_entries` ahead of the last
    /// one on disk.
    pub(crate) fn trigger_snapshot(self: &Arc<Self>, ep: &mut Progress) {
        let force_disk =
            ep.applied_index.saturating_sub(ep.disk_snapshot_index) >= self.cfg.snapshot_catch_up_entries;
        let memory_due = ep.applied_index.saturating_sub(ep.memory_snapshot_index) > self.cfg.snapshot_count;

        if !(memory_due || force_disk) {
            return;
        }
        tracing::info!(
            applied_index = ep.applied_index,
            disk_snapshot_index = ep.disk_snapshot_index,
            to_disk = force_disk,
            "triggering snapshot"
        );
        self.snapshot(ep, force_disk);
    }

    /// Cut a snapshot at the current applied index.
    ///
    /// The progress indexes move synchronously; for a disk snapshot the
    /// save / compact / release sequence runs in its own task against the
    /// consistent image taken here.
    pub(crate) fn snapshot(self: &Arc<Self>, ep: &mut Progress, to_disk: bool) {
        let applied_index = ep.applied_index;
        let conf_state = ep.conf_state.clone();

        // A consistent read view of the state machine.
        let data = self.be.snapshot_data();

        let snap = match self.r.raft_storage().create_snapshot(applied_index, conf_state, data) {
            Ok(snap) => snap,
            Err(RaftLogError::SnapshotTemporarilyUnavailable) => {
                // A newer snapshot exists already.
                return;
            }
            Err(err) => panic!("unexpected error creating snapshot at index {applied_index}: {err}"),
        };

        ep.memory_snapshot_index = applied_index;
        if !to_disk {
            self.compact_raft_log(applied_index);
            return;
        }
        ep.disk_snapshot_index = applied_index;

        let srv = self.clone();
        tokio::spawn(async move {
            // The snapshot record must be durable before the raft log below
            // it may go away, and before older snapshot files are released.
            if let Err(err) = srv.r.storage().save_snap(&snap) {
                panic!("failed to save snapshot at index {}: {}", snap.metadata.index, err);
            }
            tracing::info!(index = snap.metadata.index, term = snap.metadata.term, "saved snapshot");

            srv.compact_raft_log(snap.metadata.index);

            if let Err(err) = srv.r.storage().release(&snap) {
                tracing::error!(error = %err, "failed to release old snapshots");
            }
        });
    }

    /// Compact the raft log, always keeping `snapshot_catch_up_entries` so a
    /// slow follower can still catch up from the log.
    fn compact_raft_log(&self, applied_index: u64) {
        if applied_index <= self.cfg.snapshot_catch_up_entries {
            return;
        }
        let compact_index = applied_index - self.cfg.snapshot_catch_up_entries;
        match self.r.raft_storage().compact(compact_index) {
            Ok(()) => {
                tracing::info!(compact_index, "compacted raft log");
            }
            Err(RaftLogError::Compacted) => {}
            Err(err) => panic!("unexpected compaction error at index {compact_index}: {err}"),
        }
    }

    /// Install a snapshot received from the leader.
    ///
    /// The raft loop has already persisted the snapshot record and synced
    /// (the first `notifyc` signal consumed here); only then is the staged
    /// DB image claimed, renamed over the live DB, and every store
    /// recovered from it.
    pub(crate) async fn apply_snapshot(self: &Arc<Self>, ep: &mut Progress, ap: &mut ToApply) {
        let Some(snapshot) = ap.snapshot.take() else {
            return;
        };
        if snapshot.is_empty() {
            return;
        }
        let meta = &snapshot.metadata;
        if meta.index <= ep.applied_index {
            panic!(
                "snapshot index {} is not newer than applied index {}",
                meta.index, ep.applied_index
            );
        }
        tracing::info!(index = meta.index, term = meta.term, "applying snapshot");

        // Wait for the raft loop: snapshot record on disk, then the staged
        // DB is ours.
        let _ = ap.notifyc.recv().await;

        let staged = self
            .snapshotter
            .db_file_path(meta.index)
            .unwrap_or_else(|err| panic!("database snapshot file for index {} missing: {}", meta.index, err));
        let live = storage::live_db_path(&self.cfg.snap_dir());
        if let Err(err) = std::fs::rename(&staged, &live) {
            panic!("failed to rename database snapshot {staged:?} to {live:?}: {err}");
        }
        if let Err(err) = self.be.restore_from_file(&live) {
            panic!("failed to restore backend from snapshot: {err}");
        }

        // Every store re-reads the restored backend; the backend is
        // authoritative for all of them.
        self.kv.restore();
        self.lessor.restore();
        self.alarm_store.restore();
        self.auth_store.restore();
        self.cluster.recover();

        let (term, index) = schema::read_consistent_index(&self.be.read_tx());
        self.consist_index.set_consistent_index(term, index);

        ep.applied_term = meta.term;
        ep.applied_index = meta.index;
        ep.conf_state = meta.conf_state.clone();
        ep.memory_snapshot_index = meta.index;
        ep.disk_snapshot_index = meta.index;
        self.state.set_applied(ep.applied_term, ep.applied_index);

        tracing::info!(index = meta.index, "applied snapshot");
    }

    /// Merge the current state machine image into an outgoing snapshot
    /// message and hand it to the transport.
    pub(crate) fn send_merged_snapshot(self: &Arc<Self>, mut m: Message, ep: &Progress) {
        let data = self.be.snapshot_data();
        m.snapshot = Some(Snapshot {
            metadata: SnapshotMetadata {
                index: ep.applied_index,
                term: ep.applied_term,
                conf_state: ep.conf_state.clone(),
            },
            data: data.clone(),
        });
        tracing::info!(to = m.to, index = ep.applied_index, "sending merged snapshot");
        self.r.transport().send_snapshot(SnapMessage { message: m, db: data });
    }
}
