//! Request decoding and the applier.
//!
//! A Normal log entry carries an [`InternalRequest`]: a header with the
//! request id (used to wake the proposer's waiter) and one operation of a
//! closed union. [`UberApplier`] dispatches the union exhaustively to the
//! KV / lease / auth / alarm / membership-attribute / cluster-version
//! appliers, all inside the batch transaction of the entry being applied.
//!
//! Replayed entries (at or below the consistent index) skip every applier
//! except the cluster-level ones, which need to rebuild the in-memory view;
//! those take the [`ShouldApply`] flag so they do not re-write the backend.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::alarm::AlarmMember;
use crate::alarm::AlarmStore;
use crate::alarm::AlarmType;
use crate::auth::AuthStatus;
use crate::auth::AuthStore;
use crate::auth::KeyPermission;
use crate::auth::Permission;
use crate::capability::CapabilityTable;
use crate::errors::ApplyError;
use crate::features;
use crate::features::FeatureGate;
use crate::lease::Lessor;
use crate::membership::Attributes;
use crate::membership::DowngradeInfo;
use crate::membership::Member;
use crate::membership::MembershipError;
use crate::membership::RaftCluster;
use crate::membership::ShouldApply;
use crate::mvcc::KvStore;
use crate::mvcc::MvccError;
use crate::mvcc::RangeResult;
use crate::storage::Backend;
use crate::storage::BatchTx;
use crate::types::MemberId;
use crate::version::SemanticVersion;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Wakes the proposer's wait-registry entry once applied.
    pub id: u64,

    /// Authenticated user the proposal was issued as; empty when auth is
    /// disabled.
    #[serde(default)]
    pub username: String,
}

/// The payload of a Normal log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalRequest {
    pub header: RequestHeader,
    pub op: RequestOp,
}

impl InternalRequest {
    pub fn new(id: u64, op: RequestOp) -> Self {
        Self {
            header: RequestHeader {
                id,
                username: String::new(),
            },
            op,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("internal request serializes")
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// The closed operation union. Dispatch is an exhaustive match so adding an
/// operation without an applier fails to compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOp {
    Put(PutRequest),
    Range(RangeRequest),
    DeleteRange(DeleteRangeRequest),
    Txn(TxnRequest),
    Compaction(CompactionRequest),
    LeaseGrant(LeaseGrantRequest),
    LeaseRevoke(LeaseRevokeRequest),
    Auth(AuthRequest),
    Alarm(AlarmRequest),
    ClusterMemberAttrSet(MemberAttrSetRequest),
    ClusterVersionSet(ClusterVersionSetRequest),
    DowngradeInfoSet(DowngradeInfoSetRequest),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    #[serde(default)]
    pub lease: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRequest {
    pub key: Vec<u8>,
    #[serde(default)]
    pub range_end: Option<Vec<u8>>,
    /// 0 reads at the latest revision.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRangeRequest {
    pub key: Vec<u8>,
    #[serde(default)]
    pub range_end: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    Greater,
    Less,
    NotEqual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareTarget {
    Version(u64),
    CreateRevision(u64),
    ModRevision(u64),
    Value(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compare {
    pub key: Vec<u8>,
    pub op: CompareOp,
    pub target: CompareTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnOp {
    Put(PutRequest),
    Range(RangeRequest),
    DeleteRange(DeleteRangeRequest),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionRequest {
    pub revision: u64,
    #[serde(default)]
    pub physical: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrantRequest {
    pub id: u64,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRevokeRequest {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthRequest {
    Enable,
    Disable,
    Status,
    UserAdd { name: String, password: String },
    UserDelete { name: String },
    UserGrantRole { user: String, role: String },
    RoleAdd { name: String },
    RoleDelete { name: String },
    RoleGrantPermission { role: String, perm: KeyPermission },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmAction {
    Get,
    Activate,
    Deactivate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRequest {
    pub action: AlarmAction,
    pub member_id: MemberId,
    pub alarm: AlarmType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAttrSetRequest {
    pub member_id: MemberId,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterVersionSetRequest {
    pub ver: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowngradeInfoSetRequest {
    pub enabled: bool,
    #[serde(default)]
    pub ver: Option<String>,
}

/// Response side of the union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    Put { revision: u64 },
    Range(RangeResult),
    DeleteRange { deleted: u64, revision: u64 },
    Txn { succeeded: bool, responses: Vec<ResponsePayload> },
    Compaction { revision: u64 },
    LeaseGrant { id: u64, ttl_secs: u64 },
    LeaseRevoke,
    AuthStatus(AuthStatus),
    AuthOk,
    Alarm { alarms: Vec<AlarmMember> },
    Empty,
}

/// What the applier hands back through the wait registry.
#[derive(Debug, Default)]
pub struct ApplyResult {
    pub resp: Option<ResponsePayload>,
    pub err: Option<ApplyError>,

    /// For physical compactions: resolved once the compaction has been
    /// physically executed.
    pub physc: Option<oneshot::Receiver<()>>,
}

impl ApplyResult {
    fn ok(resp: ResponsePayload) -> Self {
        Self {
            resp: Some(resp),
            err: None,
            physc: None,
        }
    }

    fn failed(err: ApplyError) -> Self {
        Self {
            resp: None,
            err: Some(err),
            physc: None,
        }
    }
}

/// Value delivered through the wait registry.
#[derive(Debug)]
pub enum ServerResponse {
    /// A Normal entry was applied.
    Applied(ApplyResult),
    /// A conf-change entry was applied (or failed validation).
    ConfChange(ConfChangeResponse),
    /// A replayed entry was deduplicated; no new effects.
    None,
}

#[derive(Debug)]
pub struct ConfChangeResponse {
    pub members: Vec<Member>,
    pub err: Option<MembershipError>,
}

/// The applier seam, mockable in server tests.
pub trait RequestApplier: Send + Sync {
    fn apply(&self, req: &InternalRequest, should_apply: ShouldApply) -> ApplyResult;
}

/// Write-quiescing modes driven by raised alarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplierMode {
    Normal,
    /// NOSPACE raised somewhere: mutating KV ops fail `NoSpace`.
    Capped,
    /// CORRUPT raised: every KV op fails `Corrupt`.
    Corrupt,
}

/// Everything the UberApplier dispatches into.
pub struct UberApplier {
    be: Arc<Backend>,
    kv: Arc<KvStore>,
    lessor: Arc<Lessor>,
    auth_store: Arc<AuthStore>,
    alarm_store: Arc<AlarmStore>,
    cluster: Arc<RaftCluster>,
    caps: Arc<CapabilityTable>,
    feature_gate: Arc<FeatureGate>,

    /// Backend size quota in bytes; 0 disables the check.
    quota_bytes: u64,

    mode: AtomicU8,
}

impl UberApplier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        be: Arc<Backend>,
        kv: Arc<KvStore>,
        lessor: Arc<Lessor>,
        auth_store: Arc<AuthStore>,
        alarm_store: Arc<AlarmStore>,
        cluster: Arc<RaftCluster>,
        caps: Arc<CapabilityTable>,
        feature_gate: Arc<FeatureGate>,
        quota_bytes: u64,
    ) -> Self {
        let applier = Self {
            be,
            kv,
            lessor,
            auth_store,
            alarm_store,
            cluster,
            caps,
            feature_gate,
            quota_bytes,
            mode: AtomicU8::new(ApplierMode::Normal as u8),
        };
        applier.restore_alarms();
        applier
    }

    /// Recompute the quiescing mode from the raised alarms. Called at
    /// construction and after every alarm apply.
    pub fn restore_alarms(&self) {
        let mode = if self.alarm_store.is_raised(AlarmType::Corrupt) {
            ApplierMode::Corrupt
        } else if self.alarm_store.is_raised(AlarmType::Nospace) {
            ApplierMode::Capped
        } else {
            ApplierMode::Normal
        };
        self.set_mode(mode);
    }

    fn set_mode(&self, mode: ApplierMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    fn mode(&self) -> ApplierMode {
        match self.mode.load(Ordering::Acquire) {
            x if x == ApplierMode::Capped as u8 => ApplierMode::Capped,
            x if x == ApplierMode::Corrupt as u8 => ApplierMode::Corrupt,
            _ => ApplierMode::Normal,
        }
    }

    fn check_mode(&self, op: &RequestOp) -> Result<(), ApplyError> {
        let mode = self.mode();
        let is_kv = matches!(
            op,
            RequestOp::Put(_)
                | RequestOp::Range(_)
                | RequestOp::DeleteRange(_)
                | RequestOp::Txn(_)
                | RequestOp::Compaction(_)
                | RequestOp::LeaseGrant(_)
                | RequestOp::LeaseRevoke(_)
        );
        if mode == ApplierMode::Corrupt && is_kv {
            return Err(ApplyError::Corrupt);
        }
        if mode == ApplierMode::Capped {
            let puts = match op {
                RequestOp::Put(_) | RequestOp::LeaseGrant(_) => true,
                RequestOp::Txn(txn) => txn
                    .success
                    .iter()
                    .chain(txn.failure.iter())
                    .any(|o| matches!(o, TxnOp::Put(_))),
                _ => false,
            };
            if puts {
                return Err(ApplyError::NoSpace);
            }
        }
        Ok(())
    }

    fn check_quota(&self, req: &InternalRequest) -> Result<(), ApplyError> {
        if self.quota_bytes == 0 {
            return Ok(());
        }
        let cost = match &req.op {
            RequestOp::Put(p) => (p.key.len() + p.value.len()) as u64,
            RequestOp::Txn(txn) => txn
                .success
                .iter()
                .chain(txn.failure.iter())
                .map(|o| match o {
                    TxnOp::Put(p) => (p.key.len() + p.value.len()) as u64,
                    _ => 0,
                })
                .sum(),
            _ => return Ok(()),
        };
        if self.be.size() + cost > self.quota_bytes {
            return Err(ApplyError::NoSpace);
        }
        Ok(())
    }

    fn check_auth(&self, tx: &BatchTx<'_>, req: &InternalRequest) -> Result<(), ApplyError> {
        let user = req.header.username.as_str();
        match &req.op {
            RequestOp::Put(p) => self.auth_store.is_op_permitted(tx, user, &p.key, None, Permission::Write),
            RequestOp::Range(r) => {
                self.auth_store.is_op_permitted(tx, user, &r.key, r.range_end.as_deref(), Permission::Read)
            }
            RequestOp::DeleteRange(d) => {
                self.auth_store.is_op_permitted(tx, user, &d.key, d.range_end.as_deref(), Permission::Write)
            }
            RequestOp::Txn(txn) => {
                for c in &txn.compare {
                    self.auth_store.is_op_permitted(tx, user, &c.key, None, Permission::Read)?;
                }
                for op in txn.success.iter().chain(txn.failure.iter()) {
                    match op {
                        TxnOp::Put(p) => {
                            self.auth_store.is_op_permitted(tx, user, &p.key, None, Permission::Write)?
                        }
                        TxnOp::Range(r) => self.auth_store.is_op_permitted(
                            tx,
                            user,
                            &r.key,
                            r.range_end.as_deref(),
                            Permission::Read,
                        )?,
                        TxnOp::DeleteRange(d) => self.auth_store.is_op_permitted(
                            tx,
                            user,
                            &d.key,
                            d.range_end.as_deref(),
                            Permission::Write,
                        )?,
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn apply_put(&self, tx: &mut BatchTx<'_>, p: &PutRequest) -> Result<ResponsePayload, ApplyError> {
        if p.lease != 0 && self.lessor.lookup(p.lease).is_none() {
            return Err(ApplyError::LeaseNotFound);
        }
        let revision = self.kv.put(tx, &p.key, &p.value, p.lease);
        if p.lease != 0 {
            // Checked above; the lease table only shrinks inside this same
            // apply task.
            let _ = self.lessor.attach(p.lease, &p.key);
        }
        Ok(ResponsePayload::Put { revision })
    }

    fn apply_range(&self, tx: &BatchTx<'_>, r: &RangeRequest) -> Result<ResponsePayload, ApplyError> {
        let result = self
            .kv
            .range(tx, &r.key, r.range_end.as_deref(), r.revision, r.limit as usize)
            .map_err(|e| match e {
                MvccError::Compacted => ApplyError::Compacted,
                MvccError::FutureRev => ApplyError::FutureRev,
            })?;
        Ok(ResponsePayload::Range(result))
    }

    fn apply_delete_range(&self, tx: &mut BatchTx<'_>, d: &DeleteRangeRequest) -> Result<ResponsePayload, ApplyError> {
        let (deleted, revision) = self.kv.delete_range(tx, &d.key, d.range_end.as_deref());
        Ok(ResponsePayload::DeleteRange { deleted, revision })
    }

    fn check_compare(&self, tx: &BatchTx<'_>, c: &Compare) -> bool {
        let current = self
            .kv
            .range(tx, &c.key, None, 0, 1)
            .ok()
            .and_then(|r| r.kvs.into_iter().next());

        // A missing key compares as the zero record, like the original.
        let kv = current.unwrap_or_default();
        let ord = match &c.target {
            CompareTarget::Version(v) => kv.version.cmp(v),
            CompareTarget::CreateRevision(v) => kv.create_revision.cmp(v),
            CompareTarget::ModRevision(v) => kv.mod_revision.cmp(v),
            CompareTarget::Value(v) => kv.value.cmp(v),
        };
        match c.op {
            CompareOp::Equal => ord.is_eq(),
            CompareOp::Greater => ord.is_gt(),
            CompareOp::Less => ord.is_lt(),
            CompareOp::NotEqual => !ord.is_eq(),
        }
    }

    /// Reject a txn op that would fail during execution. Run over the whole
    /// branch before the first op writes: writes land in the shared batch
    /// transaction as they execute, so a rejected Txn must be caught while
    /// it has left no trace.
    fn check_txn_op(&self, op: &TxnOp) -> Result<(), ApplyError> {
        match op {
            TxnOp::Put(p) => {
                if p.lease != 0 && self.lessor.lookup(p.lease).is_none() {
                    return Err(ApplyError::LeaseNotFound);
                }
                Ok(())
            }
            TxnOp::Range(r) => {
                if r.revision != 0 {
                    if r.revision < self.kv.compact_revision() {
                        return Err(ApplyError::Compacted);
                    }
                    if r.revision > self.kv.current_revision() {
                        return Err(ApplyError::FutureRev);
                    }
                }
                Ok(())
            }
            TxnOp::DeleteRange(_) => Ok(()),
        }
    }

    fn apply_txn(&self, tx: &mut BatchTx<'_>, t: &TxnRequest) -> Result<ResponsePayload, ApplyError> {
        let succeeded = t.compare.iter().all(|c| self.check_compare(tx, c));
        let ops = if succeeded { &t.success } else { &t.failure };

        for op in ops {
            self.check_txn_op(op)?;
        }

        // Puts only grow the revision and the lease table only shrinks
        // through LeaseRevoke (not a txn op), so the checks above cannot be
        // invalidated mid-branch and execution is infallible from here.
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let resp = match op {
                TxnOp::Put(p) => self.apply_put(tx, p)?,
                TxnOp::Range(r) => self.apply_range(tx, r)?,
                TxnOp::DeleteRange(d) => self.apply_delete_range(tx, d)?,
            };
            responses.push(resp);
        }
        Ok(ResponsePayload::Txn { succeeded, responses })
    }

    fn apply_compaction(&self, tx: &mut BatchTx<'_>, c: &CompactionRequest) -> ApplyResult {
        match self.kv.compact(tx, c.revision) {
            Ok(()) => {
                // Compaction here is physical already; hand back a resolved
                // completion channel.
                let (done_tx, done_rx) = oneshot::channel();
                let _ = done_tx.send(());
                ApplyResult {
                    resp: Some(ResponsePayload::Compaction { revision: c.revision }),
                    err: None,
                    physc: Some(done_rx),
                }
            }
            Err(MvccError::Compacted) => ApplyResult::failed(ApplyError::Compacted),
            Err(MvccError::FutureRev) => ApplyResult::failed(ApplyError::FutureRev),
        }
    }

    fn apply_lease_grant(&self, tx: &mut BatchTx<'_>, g: &LeaseGrantRequest) -> Result<ResponsePayload, ApplyError> {
        let lease = self.lessor.grant(tx, g.id, g.ttl_secs).map_err(|_| ApplyError::LeaseExist)?;
        Ok(ResponsePayload::LeaseGrant {
            id: lease.id,
            ttl_secs: lease.ttl_secs,
        })
    }

    fn apply_lease_revoke(&self, tx: &mut BatchTx<'_>, r: &LeaseRevokeRequest) -> Result<ResponsePayload, ApplyError> {
        let keys = self.lessor.revoke(tx, r.id).map_err(|_| ApplyError::LeaseNotFound)?;
        for key in keys {
            self.kv.delete_range(tx, &key, None);
        }
        Ok(ResponsePayload::LeaseRevoke)
    }

    fn apply_auth(&self, tx: &mut BatchTx<'_>, a: &AuthRequest) -> Result<ResponsePayload, ApplyError> {
        match a {
            AuthRequest::Enable => self.auth_store.enable(tx).map(|()| ResponsePayload::AuthOk),
            AuthRequest::Disable => {
                self.auth_store.disable(tx);
                Ok(ResponsePayload::AuthOk)
            }
            AuthRequest::Status => Ok(ResponsePayload::AuthStatus(self.auth_store.status())),
            AuthRequest::UserAdd { name, password } => {
                self.auth_store.user_add(tx, name, password).map(|()| ResponsePayload::AuthOk)
            }
            AuthRequest::UserDelete { name } => self.auth_store.user_delete(tx, name).map(|()| ResponsePayload::AuthOk),
            AuthRequest::UserGrantRole { user, role } => {
                self.auth_store.user_grant_role(tx, user, role).map(|()| ResponsePayload::AuthOk)
            }
            AuthRequest::RoleAdd { name } => self.auth_store.role_add(tx, name).map(|()| ResponsePayload::AuthOk),
            AuthRequest::RoleDelete { name } => self.auth_store.role_delete(tx, name).map(|()| ResponsePayload::AuthOk),
            AuthRequest::RoleGrantPermission { role, perm } => self
                .auth_store
                .role_grant_permission(tx, role, perm.clone())
                .map(|()| ResponsePayload::AuthOk),
        }
    }

    fn apply_alarm(&self, tx: &mut BatchTx<'_>, a: &AlarmRequest) -> ResponsePayload {
        let m = AlarmMember {
            member_id: a.member_id,
            alarm: a.alarm,
        };
        let alarms = match a.action {
            AlarmAction::Get => self.alarm_store.get(a.alarm),
            AlarmAction::Activate => {
                let changed = self.alarm_store.activate(tx, m);
                self.restore_alarms();
                changed.into_iter().collect()
            }
            AlarmAction::Deactivate => {
                let changed = self.alarm_store.deactivate(tx, m);
                self.restore_alarms();
                changed.into_iter().collect()
            }
        };
        ResponsePayload::Alarm { alarms }
    }

    fn apply_cluster_version_set(&self, req: &ClusterVersionSetRequest, should_apply: ShouldApply) -> ApplyResult {
        let Ok(ver) = req.ver.parse::<SemanticVersion>() else {
            return ApplyResult::failed(ApplyError::VersionNotSupported);
        };
        let caps = self.caps.clone();
        self.cluster.set_version(ver, &move |v| caps.update_for_version(v), should_apply);
        ApplyResult::ok(ResponsePayload::Empty)
    }

    fn apply_downgrade_info_set(&self, req: &DowngradeInfoSetRequest, should_apply: ShouldApply) -> ApplyResult {
        if !self.feature_gate.enabled(features::DOWNGRADE) {
            return ApplyResult::failed(ApplyError::FeatureDisabled {
                feature: features::DOWNGRADE.to_string(),
            });
        }
        let target_version = match &req.ver {
            Some(v) => match v.parse() {
                Ok(v) => Some(v),
                Err(_) => return ApplyResult::failed(ApplyError::VersionNotSupported),
            },
            None => None,
        };
        self.cluster.set_downgrade_info(
            &DowngradeInfo {
                enabled: req.enabled,
                target_version,
            },
            should_apply,
        );
        ApplyResult::ok(ResponsePayload::Empty)
    }
}

impl RequestApplier for UberApplier {
    #[tracing::instrument(level = "debug", skip_all, fields(id = req.header.id))]
    fn apply(&self, req: &InternalRequest, should_apply: ShouldApply) -> ApplyResult {
        // Cluster-level operations rebuild in-memory state even on replay.
        match &req.op {
            RequestOp::ClusterMemberAttrSet(r) => {
                self.cluster.update_attributes(r.member_id, r.attributes.clone(), should_apply);
                return ApplyResult::ok(ResponsePayload::Empty);
            }
            RequestOp::ClusterVersionSet(r) => return self.apply_cluster_version_set(r, should_apply),
            RequestOp::DowngradeInfoSet(r) => return self.apply_downgrade_info_set(r, should_apply),
            _ => {}
        }

        // Everything below has durable effects only; a replayed entry is
        // already in the backend.
        if !should_apply.backend() {
            return ApplyResult::default();
        }

        if let Err(err) = self.check_mode(&req.op).and_then(|()| self.check_quota(req)) {
            return ApplyResult::failed(err);
        }

        let mut tx = self.be.batch_tx();
        if let Err(err) = self.check_auth(&tx, req) {
            drop(tx);
            return ApplyResult::failed(err);
        }

        let result = match &req.op {
            RequestOp::Put(p) => self.apply_put(&mut tx, p).map(ApplyResult::ok).unwrap_or_else(ApplyResult::failed),
            RequestOp::Range(r) => self.apply_range(&tx, r).map(ApplyResult::ok).unwrap_or_else(ApplyResult::failed),
            RequestOp::DeleteRange(d) => {
                self.apply_delete_range(&mut tx, d).map(ApplyResult::ok).unwrap_or_else(ApplyResult::failed)
            }
            RequestOp::Txn(t) => self.apply_txn(&mut tx, t).map(ApplyResult::ok).unwrap_or_else(ApplyResult::failed),
            RequestOp::Compaction(c) => self.apply_compaction(&mut tx, c),
            RequestOp::LeaseGrant(g) => {
                self.apply_lease_grant(&mut tx, g).map(ApplyResult::ok).unwrap_or_else(ApplyResult::failed)
            }
            RequestOp::LeaseRevoke(r) => {
                self.apply_lease_revoke(&mut tx, r).map(ApplyResult::ok).unwrap_or_else(ApplyResult::failed)
            }
            RequestOp::Alarm(a) => ApplyResult::ok(self.apply_alarm(&mut tx, a)),
            RequestOp::Auth(a) => self.apply_auth(&mut tx, a).map(ApplyResult::ok).unwrap_or_else(ApplyResult::failed),
            RequestOp::ClusterMemberAttrSet(_) | RequestOp::ClusterVersionSet(_) | RequestOp::DowngradeInfoSet(_) => {
                unreachable!("cluster operations dispatched above")
            }
        };
        tx.commit();

        if let Some(err) = &result.err {
            tracing::debug!(id = req.header.id, error = %err, "apply failed");
        }
        result
    }
}
