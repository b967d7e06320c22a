//! Client-facing proposals: normal requests and membership changes.

use crate::apply::ApplyResult;
use crate::apply::InternalRequest;
use crate::apply::ServerResponse;
use crate::errors::ServerError;
use crate::features;
use crate::membership::Member;
use crate::raft::ConfChange;
use crate::raft::ConfChangeKind;
use crate::server::Server;
use crate::types::MemberId;

impl Server {
    /// Propose a normal request and wait for its apply result.
    ///
    /// Assigns a fresh request id when the header has none, enforces the
    /// proposal size limit, and bounds the wait with the configured request
    /// timeout. A timed-out registration is freed lazily when the applier
    /// eventually triggers it.
    pub async fn raft_request(&self, mut req: InternalRequest) -> Result<ApplyResult, ServerError> {
        if req.header.id == 0 {
            req.header.id = self.req_id_gen.next();
        }
        let deadline = tokio::time::sleep(self.cfg.request_timeout());
        tokio::pin!(deadline);

        tokio::select! {
            res = self.raft_request_once(&req) => res,
            _ = &mut deadline => Err(ServerError::Timeout),
        }
    }

    /// One proposal attempt with no wall-clock bound; callers own the
    /// deadline.
    pub(crate) async fn raft_request_once(&self, req: &InternalRequest) -> Result<ApplyResult, ServerError> {
        let data = req.encode();
        if data.len() > self.cfg.max_request_bytes as usize {
            return Err(ServerError::RequestTooLarge);
        }
        let id = req.header.id;
        let rx = self.w.register(id);

        if let Err(err) = self.r.node().propose(data).await {
            tracing::warn!(id = id, error = %err, "proposal failed");
            self.w.trigger(id, ServerResponse::None);
            return Err(ServerError::ProposalDropped);
        }

        tokio::select! {
            resp = rx => match resp {
                Ok(ServerResponse::Applied(ar)) => Ok(ar),
                Ok(ServerResponse::None) => Ok(ApplyResult::default()),
                Ok(ServerResponse::ConfChange(_)) => Ok(ApplyResult::default()),
                Err(_) => Err(ServerError::Stopped),
            },
            _ = self.stopping.closed() => Err(ServerError::Stopped),
        }
    }

    /// Propose adding a member (or learner) to the cluster.
    pub async fn add_member(&self, m: Member) -> Result<Vec<Member>, ServerError> {
        let kind = if m.is_learner() {
            ConfChangeKind::AddLearnerNode
        } else {
            ConfChangeKind::AddNode
        };
        let cc = ConfChange {
            id: self.req_id_gen.next(),
            kind,
            node_id: m.id.get(),
            context: m.encode(),
        };
        self.configure(cc).await
    }

    /// Propose removing a member.
    pub async fn remove_member(&self, id: MemberId) -> Result<Vec<Member>, ServerError> {
        let cc = ConfChange {
            id: self.req_id_gen.next(),
            kind: ConfChangeKind::RemoveNode,
            node_id: id.get(),
            context: Vec::new(),
        };
        self.configure(cc).await
    }

    /// Propose replacing a member's peer URLs.
    pub async fn update_member(&self, m: Member) -> Result<Vec<Member>, ServerError> {
        let cc = ConfChange {
            id: self.req_id_gen.next(),
            kind: ConfChangeKind::UpdateNode,
            node_id: m.id.get(),
            context: m.encode(),
        };
        self.configure(cc).await
    }

    /// Propose promoting a learner to a voting member.
    pub async fn promote_member(&self, id: MemberId) -> Result<Vec<Member>, ServerError> {
        if !self.feature_gate.enabled(features::MEMBER_PROMOTE) {
            return Err(ServerError::FeatureDisabled(features::MEMBER_PROMOTE.to_string()));
        }
        let cc = ConfChange {
            id: self.req_id_gen.next(),
            kind: ConfChangeKind::PromoteNode,
            node_id: id.get(),
            context: Vec::new(),
        };
        self.configure(cc).await
    }

    /// Propose a conf change and wait until it is applied (or rejected by
    /// validation on apply).
    async fn configure(&self, cc: ConfChange) -> Result<Vec<Member>, ServerError> {
        let id = cc.id;
        let rx = self.w.register(id);

        if let Err(err) = self.r.node().propose_conf_change(cc).await {
            tracing::warn!(id = id, error = %err, "conf change proposal failed");
            self.w.trigger(id, ServerResponse::None);
            return Err(ServerError::ProposalDropped);
        }

        let deadline = tokio::time::sleep(self.cfg.request_timeout());
        tokio::pin!(deadline);

        tokio::select! {
            resp = rx => match resp {
                Ok(ServerResponse::ConfChange(r)) => match r.err {
                    None => Ok(r.members),
                    Some(err) => Err(ServerError::Membership(err)),
                },
                Ok(_) => Ok(self.cluster.members()),
                Err(_) => Err(ServerError::Stopped),
            },
            _ = self.stopping.closed() => Err(ServerError::Stopped),
            _ = &mut deadline => Err(ServerError::TimeoutDueToLeaderFail),
        }
    }
}
