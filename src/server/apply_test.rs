use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use crate::apply::InternalRequest;
use crate::apply::PutRequest;
use crate::apply::RequestOp;
use crate::apply::ResponsePayload;
use crate::apply::ServerResponse;
use crate::membership::Member;
use crate::membership::MembershipError;
use crate::membership::ShouldApply;
use crate::raft::ConfChange;
use crate::raft::ConfChangeKind;
use crate::raft::ConfState;
use crate::raft::Entry;
use crate::raft::EntryKind;
use crate::raft::NONE;
use crate::server::test_util::new_test_server;
use crate::storage::schema;
use crate::testing::Action;
use crate::testing::NodeRecorder;
use crate::types::MemberId;

fn conf_change_entry(term: u64, index: u64, cc: &ConfChange) -> Entry {
    Entry {
        term,
        index,
        kind: EntryKind::ConfChange,
        data: serde_json::to_vec(cc).expect("conf change serializes"),
    }
}

/// A pre-signalled raft-advanced channel, standing in for the raft loop.
/// The buffered signal survives the sender; recv drains it before seeing
/// the closed channel.
fn advanced_channel() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);
    tx.try_send(()).unwrap();
    rx
}

/// A conf change that fails validation is recorded by consensus as a no-op
/// (`node_id` rewritten to zero) with the original context, and the
/// validation error is surfaced.
#[tokio::test]
async fn test_apply_conf_change_error() -> anyhow::Result<()> {
    let member = |id: u64, port: u16| Member::new(MemberId(id), vec![format!("http://127.0.0.1:{port}")], false);

    struct Case {
        cc: ConfChange,
        want_err: MembershipError,
    }
    let cases = vec![
        Case {
            cc: ConfChange {
                id: 0,
                kind: ConfChangeKind::AddNode,
                node_id: 4,
                context: member(4, 4).encode(),
            },
            want_err: MembershipError::IdRemoved,
        },
        Case {
            cc: ConfChange {
                id: 0,
                kind: ConfChangeKind::UpdateNode,
                node_id: 4,
                context: member(4, 4).encode(),
            },
            want_err: MembershipError::IdRemoved,
        },
        Case {
            cc: ConfChange {
                id: 0,
                kind: ConfChangeKind::AddNode,
                node_id: 1,
                context: member(1, 1).encode(),
            },
            want_err: MembershipError::IdExists,
        },
        Case {
            cc: ConfChange {
                id: 0,
                kind: ConfChangeKind::RemoveNode,
                node_id: 5,
                context: Vec::new(),
            },
            want_err: MembershipError::IdNotFound,
        },
    ];

    for (i, case) in cases.into_iter().enumerate() {
        let node = Arc::new(NodeRecorder::new());
        let rec = node.recorder();
        let (srv, _dir) = new_test_server(node);
        for id in 1..=4u64 {
            srv.cluster.add_member(&member(id, id as u16), ShouldApply::Both)?;
        }
        srv.cluster.remove_member(MemberId(4), ShouldApply::Both)?;

        let err = srv
            .apply_conf_change(case.cc.clone(), None, ShouldApply::Both)
            .expect_err("validation must fail");
        assert_eq!(case.want_err, err, "case #{i}");

        let rewritten = ConfChange {
            node_id: NONE,
            ..case.cc
        };
        assert_eq!(
            vec![Action::with_params("ApplyConfChange", vec![format!("{rewritten:?}")])],
            rec.actions(),
            "case #{i}"
        );
    }
    Ok(())
}

/// Removing the local member stops the server; removing anyone else does
/// not.
#[tokio::test]
async fn test_apply_conf_change_should_stop() -> anyhow::Result<()> {
    let node = Arc::new(NodeRecorder::new());
    let (srv, _dir) = new_test_server(node);
    for id in 1..=3u64 {
        srv.cluster.add_member(&Member::new(MemberId(id), vec![], false), ShouldApply::Both)?;
    }

    let mut cc = ConfChange {
        id: 0,
        kind: ConfChangeKind::RemoveNode,
        node_id: 2,
        context: Vec::new(),
    };
    let should_stop = srv.apply_conf_change(cc.clone(), Some(&mut ConfState::default()), ShouldApply::Both)?;
    assert!(!should_stop);

    // The local member id is 1.
    cc.node_id = 1;
    let should_stop = srv.apply_conf_change(cc, Some(&mut ConfState::default()), ShouldApply::Both)?;
    assert!(should_stop);
    Ok(())
}

#[tokio::test]
async fn test_apply_multi_conf_change_should_stop() -> anyhow::Result<()> {
    let node = Arc::new(NodeRecorder::new());
    let (mut srv, _dir) = new_test_server(node);
    srv.member_id = MemberId(2);
    for id in 1..=5u64 {
        srv.cluster.add_member(&Member::new(MemberId(id), vec![], false), ShouldApply::Both)?;
    }
    let srv = Arc::new(srv);

    let ents: Vec<Entry> = (1..=4u64)
        .map(|i| {
            conf_change_entry(
                1,
                i,
                &ConfChange {
                    id: 0,
                    kind: ConfChangeKind::RemoveNode,
                    node_id: i,
                    context: Vec::new(),
                },
            )
        })
        .collect();

    let mut advanced = advanced_channel();
    let (_term, _index, should_stop) = srv.apply(&ents, &mut ConfState::default(), Some(&mut advanced)).await;
    assert!(should_stop);
    Ok(())
}

/// A conf-change entry advances the consistent index, and the pre-commit
/// hook lands both the cursor and the voting configuration in the meta
/// bucket.
#[tokio::test]
async fn test_apply_conf_change_updates_consistent_index() -> anyhow::Result<()> {
    let node = Arc::new(NodeRecorder::new());
    node.set_conf_state(ConfState {
        voters: vec![2],
        learners: vec![],
    });
    let (srv, _dir) = new_test_server(node);
    srv.cluster.add_member(&Member::new(MemberId(1), vec![], false), ShouldApply::Both)?;
    let srv = Arc::new(srv);

    let cc = ConfChange {
        id: 0,
        kind: ConfChangeKind::AddNode,
        node_id: 2,
        context: Member::new(MemberId(2), vec!["http://whatever:123".to_string()], false).encode(),
    };
    let ents = vec![conf_change_entry(4, 2, &cc)];

    let mut advanced = advanced_channel();
    let (_term, applied_index, _stop) = srv.apply(&ents, &mut ConfState::default(), Some(&mut advanced)).await;
    assert_eq!(2, applied_index);
    assert_eq!(2, srv.consist_index.consistent_index());
    assert_eq!(4, srv.consist_index.consistent_term());

    srv.be.force_commit();
    let rtx = srv.be.read_tx();
    assert_eq!((4, 2), schema::read_consistent_index(&rtx));
    assert_eq!(
        Some(ConfState {
            voters: vec![2],
            learners: vec![]
        }),
        schema::conf_state_from_backend(&rtx)
    );
    Ok(())
}

/// Replaying an already-applied batch must not change observable state: the
/// cursor stays put and the membership view is unchanged.
#[tokio::test]
async fn test_apply_is_idempotent_across_replay() -> anyhow::Result<()> {
    let node = Arc::new(NodeRecorder::new());
    let (srv, _dir) = new_test_server(node);
    let srv = Arc::new(srv);

    let member_ctx = Member::new(MemberId(7), vec!["http://127.0.0.1:7".to_string()], false);
    let ents = vec![
        conf_change_entry(
            1,
            1,
            &ConfChange {
                id: 0,
                kind: ConfChangeKind::AddNode,
                node_id: 7,
                context: member_ctx.encode(),
            },
        ),
        conf_change_entry(
            1,
            2,
            &ConfChange {
                id: 0,
                kind: ConfChangeKind::RemoveNode,
                node_id: 7,
                context: Vec::new(),
            },
        ),
    ];

    let mut advanced = advanced_channel();
    let (_t, i1, _s) = srv.apply(&ents, &mut ConfState::default(), Some(&mut advanced)).await;
    assert_eq!(2, i1);
    srv.be.force_commit();

    let members_after_first = srv.cluster.members();
    let removed_after_first = srv.cluster.is_id_removed(MemberId(7));
    let cindex_after_first = srv.consist_index.consistent_index();

    // Second pass over the same batch: every entry replays as a no-op.
    let mut advanced = advanced_channel();
    let (_t, i2, _s) = srv.apply(&ents, &mut ConfState::default(), Some(&mut advanced)).await;
    srv.be.force_commit();

    assert_eq!(i1, i2);
    assert_eq!(members_after_first, srv.cluster.members());
    assert_eq!(removed_after_first, srv.cluster.is_id_removed(MemberId(7)));
    assert_eq!(cindex_after_first, srv.consist_index.consistent_index());
    Ok(())
}

/// Every Normal entry wakes its registered waiter: with a result when it
/// applies, with an empty result when it replays below the cursor.
#[tokio::test]
async fn test_waiter_fires_on_apply_and_replay() -> anyhow::Result<()> {
    let node = Arc::new(NodeRecorder::new());
    let (srv, _dir) = new_test_server(node);
    let srv = Arc::new(srv);

    let req = InternalRequest::new(
        9,
        RequestOp::Put(PutRequest {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            lease: 0,
        }),
    );
    let entry = Entry {
        term: 1,
        index: 1,
        kind: EntryKind::Normal,
        data: req.encode(),
    };

    let rx = srv.w.register(9);
    srv.apply_entry_normal(&entry);
    match rx.await? {
        ServerResponse::Applied(ar) => {
            assert_eq!(Some(ResponsePayload::Put { revision: 1 }), ar.resp);
            assert_eq!(None, ar.err);
        }
        other => panic!("unexpected response {other:?}"),
    }
    srv.be.force_commit();

    // Replay of the same entry: the waiter still fires, with no effects.
    let rx = srv.w.register(9);
    srv.apply_entry_normal(&entry);
    match rx.await? {
        ServerResponse::Applied(ar) => {
            assert_eq!(None, ar.resp);
            assert_eq!(None, ar.err);
        }
        other => panic!("unexpected response {other:?}"),
    }
    Ok(())
}

/// An empty Normal entry is the no-op raft commits on leader election; it
/// fires the first-commit-in-term notifier.
#[tokio::test]
async fn test_empty_entry_notifies_first_commit_in_term() {
    let node = Arc::new(NodeRecorder::new());
    let (srv, _dir) = new_test_server(node);
    let srv = Arc::new(srv);

    let mut rx = srv.state.first_commit_in_term.subscribe();
    srv.apply_entry_normal(&Entry {
        term: 2,
        index: 1,
        kind: EntryKind::Normal,
        data: Vec::new(),
    });
    tokio::time::timeout(std::time::Duration::from_secs(1), rx.changed())
        .await
        .expect("notified")
        .expect("notifier alive");
}
