//! The apply path: committed entries into state machine effects.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::alarm::AlarmType;
use crate::apply::AlarmAction;
use crate::apply::AlarmRequest;
use crate::apply::ConfChangeResponse;
use crate::apply::InternalRequest;
use crate::apply::RequestOp;
use crate::apply::ServerResponse;
use crate::errors::ApplyError;
use crate::membership::Member;
use crate::membership::MembershipError;
use crate::membership::ShouldApply;
use crate::raft::ConfChange;
use crate::raft::ConfChangeKind;
use crate::raft::ConfState;
use crate::raft::Entry;
use crate::raft::EntryKind;
use crate::raft::ToApply;
use crate::raft::NONE;
use crate::server::Progress;
use crate::server::Server;
use crate::types::MemberId;

impl Server {
    /// Apply the un-applied suffix of a committed batch. Returns whether the
    /// local member was removed.
    pub(crate) async fn apply_entries(self: &Arc<Self>, ep: &mut Progress, ap: &mut ToApply) -> bool {
        if ap.entries.is_empty() {
            return false;
        }
        let first = ap.entries[0].index;
        if first > ep.applied_index + 1 {
            panic!(
                "unexpected committed entry index {} (applied index {}, gap in the log)",
                first, ep.applied_index
            );
        }

        // Entries at or below the applied index were delivered before; only
        // the suffix is new.
        let offset = (ep.applied_index + 1).saturating_sub(first) as usize;
        if offset >= ap.entries.len() {
            return false;
        }
        let ents = ap.entries[offset..].to_vec();

        let (applied_term, applied_index, should_stop) =
            self.apply(&ents, &mut ep.conf_state, Some(&mut ap.raft_advanced)).await;
        ep.applied_term = applied_term;
        ep.applied_index = applied_index;
        should_stop
    }

    /// Apply entries in order, waking each entry's waiter.
    ///
    /// Returns `(applied_term, applied_index, should_stop)`. When
    /// `raft_advanced` is given, the call returns only after the raft loop
    /// has advanced past the batch, so the batch is durably acknowledged
    /// before it becomes externally observable.
    pub(crate) async fn apply(
        self: &Arc<Self>,
        entries: &[Entry],
        conf_state: &mut ConfState,
        mut raft_advanced: Option<&mut mpsc::Receiver<()>>,
    ) -> (u64, u64, bool) {
        let mut applied_term = 0;
        let mut applied_index = 0;
        let mut should_stop = false;

        for e in entries {
            tracing::debug!(index = e.index, term = e.term, kind = ?e.kind, "applying entry");
            match e.kind {
                EntryKind::Normal => self.apply_entry_normal(e),
                EntryKind::ConfChange => {
                    let mut should_apply = ShouldApply::StoreOnly;
                    if e.index > self.consist_index.consistent_index() {
                        // Stage the cursor so it commits with this entry's
                        // effects.
                        self.consist_index.set_consistent_applying(e.term, e.index);
                        should_apply = ShouldApply::Both;
                    }

                    let cc: ConfChange = serde_json::from_slice(&e.data)
                        .unwrap_or_else(|err| panic!("malformed conf change at index {}: {}", e.index, err));
                    let (removed_self, err) = match self.apply_conf_change(cc.clone(), Some(conf_state), should_apply)
                    {
                        Ok(removed_self) => (removed_self, None),
                        Err(err) => {
                            tracing::warn!(index = e.index, error = %err, "conf change failed validation");
                            (false, Some(err))
                        }
                    };
                    should_stop = should_stop || removed_self;

                    self.w.trigger(
                        cc.id,
                        ServerResponse::ConfChange(ConfChangeResponse {
                            members: self.cluster.members(),
                            err,
                        }),
                    );
                }
            }
            applied_term = e.term;
            applied_index = e.index;
            self.state.set_applied(applied_term, applied_index);
        }

        if let Some(rx) = raft_advanced.as_deref_mut() {
            let _ = rx.recv().await;
        }
        (applied_term, applied_index, should_stop)
    }

    /// Apply a Normal entry.
    ///
    /// Entries at or below the consistent index replay without durable side
    /// effects; their waiters (if any) still fire so no client hangs. An
    /// applier `NoSpace` failure raises the NOSPACE alarm through the log
    /// before the waiter fires.
    pub(crate) fn apply_entry_normal(self: &Arc<Self>, e: &Entry) {
        let mut should_apply = ShouldApply::StoreOnly;
        if e.index > self.consist_index.consistent_index() {
            self.consist_index.set_consistent_applying(e.term, e.index);
            should_apply = ShouldApply::Both;
        }

        // Raft proposes an empty entry on leader election.
        if e.data.is_empty() {
            self.state.first_commit_in_term.notify();
            return;
        }

        let req = InternalRequest::decode(&e.data)
            .unwrap_or_else(|err| panic!("malformed internal request at index {}: {}", e.index, err));
        let id = req.header.id;

        let need_result = self.w.is_registered(id);
        if !(need_result || should_apply.backend()) {
            return;
        }

        let ar = self.uber_apply.apply(&req, should_apply);
        if !matches!(ar.err, Some(ApplyError::NoSpace)) {
            self.w.trigger(id, ServerResponse::Applied(ar));
            return;
        }

        tracing::error!(
            index = e.index,
            "applying raft message exceeded backend quota, raising alarm"
        );
        let srv = self.clone();
        tokio::spawn(async move {
            let alarm = InternalRequest::new(
                srv.req_id_gen.next(),
                RequestOp::Alarm(AlarmRequest {
                    action: AlarmAction::Activate,
                    member_id: srv.member_id,
                    alarm: AlarmType::Nospace,
                }),
            );
            if let Err(err) = srv.raft_request(alarm).await {
                tracing::warn!(error = %err, "failed to raise NOSPACE alarm");
            }
            srv.w.trigger(id, ServerResponse::Applied(ar));
        });
    }

    /// Apply a membership change.
    ///
    /// A change that fails validation is still recorded by consensus as a
    /// no-op (`node_id` rewritten to zero) so the configuration state keeps
    /// advancing in lockstep across members; the validation error is
    /// returned for the proposer. Returns true when the local member was
    /// removed.
    pub(crate) fn apply_conf_change(
        &self,
        mut cc: ConfChange,
        conf_state: Option<&mut ConfState>,
        should_apply: ShouldApply,
    ) -> Result<bool, MembershipError> {
        if let Err(err) = self.cluster.validate_conf_change(&cc) {
            cc.node_id = NONE;
            self.r.node().apply_conf_change(&cc);
            return Err(err);
        }

        let cs = self.r.node().apply_conf_change(&cc);
        if let Some(out) = conf_state {
            *out = cs;
            self.be_hooks.set_conf_state(out);
        }

        let id = MemberId(cc.node_id);
        match cc.kind {
            ConfChangeKind::AddNode | ConfChangeKind::AddLearnerNode => {
                let m = Member::decode(&cc.context)
                    .unwrap_or_else(|err| panic!("malformed member in conf change context: {err}"));
                if m.id != id {
                    panic!("conf change member id {} does not match node id {}", m.id, id);
                }
                self.cluster.add_member(&m, should_apply)?;
            }
            ConfChangeKind::RemoveNode => {
                self.cluster.remove_member(id, should_apply)?;
                if id == self.member_id {
                    tracing::info!(member = %id, "local member removed by conf change");
                    return Ok(true);
                }
            }
            ConfChangeKind::UpdateNode => {
                let m = Member::decode(&cc.context)
                    .unwrap_or_else(|err| panic!("malformed member in conf change context: {err}"));
                self.cluster.update_raft_attributes(id, m.raft_attributes, should_apply)?;
            }
            ConfChangeKind::PromoteNode => {
                self.cluster.promote_member(id, should_apply)?;
            }
        }
        Ok(false)
    }
}
