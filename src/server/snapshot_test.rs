use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::raft::ConfState;
use crate::raft::Entry;
use crate::raft::Message;
use crate::raft::MessageKind;
use crate::raft::Ready;
use crate::raft::Snapshot;
use crate::raft::SnapshotMetadata;
use crate::server::test_util::new_test_server;
use crate::server::test_util::new_test_server_with;
use crate::server::Progress;
use crate::snap::Snapshotter;
use crate::testing::NodeRecorder;
use crate::testing::SnapTransport;
use crate::testing::StorageRecorder;
use crate::testing::StoreRecorder;

fn log_entry(term: u64, index: u64) -> Entry {
    Entry {
        term,
        index,
        ..Entry::default()
    }
}

/// A disk snapshot saves the snapshot record and releases older snapshot
/// files, advancing both snapshot indexes. The legacy store is untouched.
#[tokio::test(flavor = "multi_thread")]
async fn test_snapshot_disk() -> anyhow::Result<()> {
    let node = Arc::new(NodeRecorder::new());
    let storage = Arc::new(StorageRecorder::new());
    let storage_rec = storage.recorder();

    let (srv, _dir) = new_test_server_with(node, storage, Arc::new(crate::testing::NopTransport));
    let mirror = StoreRecorder::new();
    let mirror_rec = mirror.recorder();
    srv.cluster.set_store(Arc::new(mirror));
    srv.r.raft_storage().append(&[log_entry(1, 1)]);
    let srv = Arc::new(srv);

    let mut ep = Progress {
        applied_index: 1,
        applied_term: 1,
        conf_state: ConfState {
            voters: vec![1],
            learners: vec![],
        },
        ..Progress::default()
    };
    srv.snapshot(&mut ep, true);

    let actions = tokio::time::timeout(Duration::from_secs(5), storage_rec.wait(2)).await?;
    assert_eq!(2, actions.len());
    assert_eq!("SaveSnap", actions[0].name);
    assert_eq!("Release", actions[1].name);

    assert_eq!(1, ep.disk_snapshot_index);
    assert_eq!(1, ep.memory_snapshot_index);
    assert!(mirror_rec.actions().is_empty(), "snapshot must not touch the legacy store");
    Ok(())
}

/// A memory snapshot only trims the in-memory raft log: no persistent
/// storage actions, and the disk snapshot index stays put.
#[tokio::test(flavor = "multi_thread")]
async fn test_snapshot_memory() -> anyhow::Result<()> {
    let node = Arc::new(NodeRecorder::new());
    let storage = Arc::new(StorageRecorder::new());
    let storage_rec = storage.recorder();

    let (srv, _dir) = new_test_server_with(node, storage, Arc::new(crate::testing::NopTransport));
    srv.r.raft_storage().append(&[log_entry(1, 1)]);
    let srv = Arc::new(srv);

    let mut ep = Progress {
        applied_index: 1,
        applied_term: 1,
        conf_state: ConfState {
            voters: vec![1],
            learners: vec![],
        },
        ..Progress::default()
    };
    srv.snapshot(&mut ep, false);

    assert!(storage_rec.actions().is_empty());
    assert_eq!(0, ep.disk_snapshot_index);
    assert_eq!(1, ep.memory_snapshot_index);
    Ok(())
}

/// The disk snapshot cadence: once the applied index runs
/// `snapshot_catch_up_entries` ahead of the last disk snapshot, exactly one
/// SaveSnap/Release pair is observed and both indexes jump to the applied
/// index.
#[tokio::test(flavor = "multi_thread")]
async fn test_snapshot_disk_cadence() -> anyhow::Result<()> {
    let node = Arc::new(NodeRecorder::new());
    let storage = Arc::new(StorageRecorder::new());
    let storage_rec = storage.recorder();

    let (mut srv, _dir) = new_test_server_with(node, storage, Arc::new(crate::testing::NopTransport));
    srv.cfg.snapshot_catch_up_entries = 5;
    let ents: Vec<Entry> = (1..=10).map(|i| log_entry(1, i)).collect();
    srv.r.raft_storage().append(&ents);
    let srv = Arc::new(srv);

    let mut ep = Progress {
        conf_state: ConfState {
            voters: vec![1],
            learners: vec![],
        },
        ..Progress::default()
    };
    for i in 1..=4 {
        ep.applied_index = i;
        srv.trigger_snapshot(&mut ep);
    }
    assert!(storage_rec.actions().is_empty(), "below the cadence threshold");

    // The batch carrying entries 5..=10 pushes the applied index past the
    // cadence; the decision runs once per batch.
    ep.applied_index = 10;
    srv.trigger_snapshot(&mut ep);

    let actions = tokio::time::timeout(Duration::from_secs(5), storage_rec.wait(2)).await?;
    let names: Vec<&str> = actions.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(vec!["SaveSnap", "Release"], names, "exactly one snapshot");
    assert_eq!(10, ep.disk_snapshot_index);
    assert_eq!(10, ep.memory_snapshot_index);

    // The raft log keeps the catch-up margin: nothing beyond
    // applied - catch_up may be compacted.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if srv.r.raft_storage().first_index() == 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }
            break;
        }
    })
    .await?;
    assert_eq!(6, srv.r.raft_storage().first_index());
    Ok(())
}

/// The snapshot ordering invariant: a received snapshot's record is saved
/// and synced before the staged DB image is renamed over the live DB.
#[tokio::test(flavor = "multi_thread")]
async fn test_snapshot_ordering() -> anyhow::Result<()> {
    crate::server::test_util::init_tracing();
    let node = Arc::new(NodeRecorder::new());
    let (storage, action_rx) = StorageRecorder::new_stream();

    let dir = tempfile::tempdir()?;
    let snap_dir = dir.path().join("member").join("snap");
    std::fs::create_dir_all(&snap_dir)?;
    let snapshotter = Snapshotter::new(&snap_dir);
    let (transport, mut snap_rx) = SnapTransport::new(snapshotter.clone());

    let (mut srv, _dir) = new_test_server_with(node.clone(), Arc::new(storage), Arc::new(transport));
    srv.cfg.data_dir = dir.path().to_path_buf();
    srv.snapshotter = Arc::new(snapshotter.clone());
    let srv = Arc::new(srv);
    srv.start_core();

    // An outgoing snapshot message makes the server stage a DB image on the
    // "receiving" side (the snap transport plays both ends).
    node.push_ready(Ready {
        messages: vec![Message::new(MessageKind::Snapshot, 2, 1)],
        ..Ready::default()
    })
    .await;

    {
        let node = node.clone();
        tokio::spawn(async move {
            // The transport staged the DB at index + 1; deliver the
            // snapshot at that index back to the server.
            let snap_msg = snap_rx.recv().await.expect("snapshot sent");
            let mut snapshot = snap_msg.snapshot().clone();
            snapshot.metadata.index += 1;
            snapshot.metadata.term = 1;
            node.push_ready(Ready {
                snapshot: Some(snapshot),
                ..Ready::default()
            })
            .await;
        });
    }

    let recv = |rx: &std::sync::mpsc::Receiver<crate::testing::Action>| {
        rx.recv_timeout(Duration::from_secs(5)).expect("storage action")
    };

    // First Ready (messages only) saves; the snapshot Ready then saves the
    // snapshot record before anything else.
    assert_eq!("Save", recv(&action_rx).name);
    assert_eq!("SaveSnap", recv(&action_rx).name);
    assert_eq!("Save", recv(&action_rx).name);

    // The staged DB image must still be in place: the rename may not happen
    // before the record is synced.
    assert!(snapshotter.db_file_path(1).is_ok());

    assert_eq!("Sync", recv(&action_rx).name);
    assert_eq!("Release", recv(&action_rx).name);

    // Now the applier claims the image: staged file gone, live DB in place.
    tokio::time::timeout(Duration::from_secs(5), async {
        while snapshotter.db_file_path(1).is_ok() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert!(crate::storage::live_db_path(&srv.cfg.snap_dir()).exists());

    tokio::time::timeout(Duration::from_secs(5), async {
        while srv.applied_index() != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    srv.stop().await;
    Ok(())
}

/// A snapshot that trails the applied index indicates a broken pipeline.
#[tokio::test]
#[should_panic(expected = "not newer than applied index")]
async fn test_stale_snapshot_panics() {
    let node = Arc::new(NodeRecorder::new());
    let (srv, _dir) = new_test_server(node);
    let srv = Arc::new(srv);

    let mut ep = Progress {
        applied_index: 5,
        ..Progress::default()
    };
    let (_tx, notifyc) = tokio::sync::mpsc::channel(1);
    let (_tx2, raft_advanced) = tokio::sync::mpsc::channel(1);
    let mut ap = crate::raft::ToApply {
        entries: Vec::new(),
        snapshot: Some(Snapshot {
            metadata: SnapshotMetadata {
                index: 3,
                term: 1,
                conf_state: ConfState::default(),
            },
            data: Vec::new(),
        }),
        notifyc,
        raft_advanced,
    };
    srv.apply_snapshot(&mut ep, &mut ap).await;
}
