//! The cluster membership view.
//!
//! [`RaftCluster`] is the in-memory member table. Every mutation happens
//! inside the apply of a conf-change or attribute entry and is mirrored to
//! the membership buckets in the backend (authoritative across restarts) and
//! to the legacy hierarchical store (a compatibility write-only sink).

mod store;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;

use crate::notify::Notifier;
use crate::raft::ConfChange;
use crate::raft::ConfChangeKind;
use crate::storage::schema::MembershipBackend;
use crate::types::MemberId;
use crate::version::SemanticVersion;

pub use self::store::paths;
pub use self::store::HierStore;
pub use self::store::LegacyStore;

/// Learner members the cluster admits at once. Every learner streams a
/// snapshot from the leader while it catches up; admitting too many at a
/// time starves replication to the voters.
pub const DEFAULT_MAX_LEARNERS: usize = 1;

/// Validation failures of membership mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipError {
    #[error("member ID already exists")]
    IdExists,

    #[error("member ID has been removed")]
    IdRemoved,

    #[error("member ID not found")]
    IdNotFound,

    #[error("peer URL already exists")]
    PeerUrlExists,

    #[error("can only promote a learner member")]
    MemberNotLearner,

    #[error("too many learner members in cluster")]
    TooManyLearners,
}

/// Whether a mutation is replayed below the consistent index.
///
/// Replayed entries already have their backend effects; they still update
/// the in-memory view and the legacy store, which are rebuilt from scratch
/// on every boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldApply {
    StoreOnly,
    Both,
}

impl ShouldApply {
    pub fn backend(&self) -> bool {
        matches!(self, ShouldApply::Both)
    }
}

/// Replication-relevant member attributes, settable only through conf
/// changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftAttributes {
    #[serde(rename = "PeerURLs", default)]
    pub peer_urls: Vec<String>,

    #[serde(rename = "IsLearner", default)]
    pub is_learner: bool,
}

/// Free-form member attributes, settable only through a Normal
/// `ClusterMemberAttrSet` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "ClientURLs", default)]
    pub client_urls: Vec<String>,
}

/// A cluster member. The JSON shape is the on-disk record format of the
/// membership buckets and the conf-change context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    #[serde(rename = "ID")]
    pub id: MemberId,

    #[serde(flatten)]
    pub raft_attributes: RaftAttributes,

    #[serde(rename = "Attributes", default)]
    pub attributes: Attributes,
}

impl Member {
    pub fn new(id: MemberId, peer_urls: Vec<String>, is_learner: bool) -> Self {
        Self {
            id,
            raft_attributes: RaftAttributes { peer_urls, is_learner },
            attributes: Attributes::default(),
        }
    }

    pub fn is_learner(&self) -> bool {
        self.raft_attributes.is_learner
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("member serializes")
    }

    pub fn decode(data: &[u8]) -> Result<Member, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Cluster downgrade state, recorded in the cluster bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowngradeInfo {
    pub enabled: bool,
    pub target_version: Option<SemanticVersion>,
}

fn raft_attrs_json(attrs: &RaftAttributes) -> String {
    serde_json::to_string(attrs).expect("raft attributes serialize")
}

fn attrs_json(attrs: &Attributes) -> String {
    serde_json::to_string(attrs).expect("attributes serialize")
}

#[derive(Debug)]
struct ClusterInner {
    members: BTreeMap<MemberId, Member>,
    removed: BTreeSet<MemberId>,
    version: Option<SemanticVersion>,
    downgrade_info: DowngradeInfo,
    max_learners: usize,
}

impl Default for ClusterInner {
    fn default() -> Self {
        Self {
            members: BTreeMap::new(),
            removed: BTreeSet::new(),
            version: None,
            downgrade_info: DowngradeInfo::default(),
            max_learners: DEFAULT_MAX_LEARNERS,
        }
    }
}

/// The membership view. All mutators take a [`ShouldApply`] deciding whether
/// the backend mirror is written; the in-memory view and the legacy store
/// are always updated.
pub struct RaftCluster {
    inner: RwLock<ClusterInner>,
    be: Mutex<Option<MembershipBackend>>,
    store: Mutex<Option<Arc<dyn LegacyStore>>>,
    version_changed: Notifier,
}

impl std::fmt::Debug for RaftCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("RaftCluster")
            .field("members", &inner.members)
            .field("removed", &inner.removed)
            .field("version", &inner.version)
            .finish()
    }
}

impl Default for RaftCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftCluster {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ClusterInner::default()),
            be: Mutex::new(None),
            store: Mutex::new(None),
            version_changed: Notifier::new(),
        }
    }

    /// Build a cluster from a fixed member list, for bootstrap and tests.
    pub fn from_members(members: impl IntoIterator<Item = Member>) -> Self {
        let cluster = Self::new();
        {
            let mut inner = cluster.inner.write().unwrap();
            for m in members {
                inner.members.insert(m.id, m);
            }
        }
        cluster
    }

    pub fn set_backend(&self, be: MembershipBackend) {
        *self.be.lock().unwrap() = Some(be);
    }

    pub fn set_store(&self, store: Arc<dyn LegacyStore>) {
        *self.store.lock().unwrap() = Some(store);
    }

    /// Raise or lower the learner admission cap.
    pub fn set_max_learners(&self, n: usize) {
        self.inner.write().unwrap().max_learners = n;
    }

    fn with_backend(&self, f: impl FnOnce(&MembershipBackend)) {
        if let Some(be) = self.be.lock().unwrap().as_ref() {
            f(be);
        }
    }

    fn with_store(&self, f: impl FnOnce(&dyn LegacyStore)) {
        if let Some(st) = self.store.lock().unwrap().as_ref() {
            f(st.as_ref());
        }
    }

    /// Rebuild the view from the backend. The backend is authoritative; the
    /// legacy store mirror is rebuilt from it.
    pub fn recover(&self) {
        let Some(be) = self.be.lock().unwrap().clone() else {
            return;
        };
        let (members, removed) = be.members_from_backend();
        let version = be.cluster_version_from_backend();
        let downgrade_info = be.downgrade_info_from_backend().unwrap_or_default();

        {
            let mut inner = self.inner.write().unwrap();
            inner.members = members.iter().map(|m| (m.id, m.clone())).collect();
            inner.removed = removed.iter().copied().collect();
            inner.version = version;
            inner.downgrade_info = downgrade_info;
        }

        self.with_store(|st| {
            for m in &members {
                st.create(&paths::member_raft_attributes(m.id), &raft_attrs_json(&m.raft_attributes));
                st.set(&paths::member_attributes(m.id), &attrs_json(&m.attributes));
            }
            for id in &removed {
                st.create(&paths::removed_member(*id), "removed");
            }
            if let Some(v) = version {
                st.set(paths::CLUSTER_VERSION, &v.to_string());
            }
        });

        tracing::info!(cluster = ?self, "recovered membership from backend");
    }

    pub fn member(&self, id: MemberId) -> Option<Member> {
        self.inner.read().unwrap().members.get(&id).cloned()
    }

    /// Members ordered by id.
    pub fn members(&self) -> Vec<Member> {
        self.inner.read().unwrap().members.values().cloned().collect()
    }

    pub fn member_ids(&self) -> Vec<MemberId> {
        self.inner.read().unwrap().members.keys().copied().collect()
    }

    pub fn is_id_removed(&self, id: MemberId) -> bool {
        self.inner.read().unwrap().removed.contains(&id)
    }

    pub fn version(&self) -> Option<SemanticVersion> {
        self.inner.read().unwrap().version
    }

    pub fn downgrade_info(&self) -> DowngradeInfo {
        self.inner.read().unwrap().downgrade_info.clone()
    }

    /// Subscribe to cluster version changes.
    pub fn version_changes(&self) -> tokio::sync::watch::Receiver<u64> {
        self.version_changed.subscribe()
    }

    /// Add a member. Fails `IdExists` if live, `IdRemoved` if previously
    /// removed.
    pub fn add_member(&self, m: &Member, should_apply: ShouldApply) -> Result<(), MembershipError> {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.removed.contains(&m.id) {
                return Err(MembershipError::IdRemoved);
            }
            if inner.members.contains_key(&m.id) {
                return Err(MembershipError::IdExists);
            }
            inner.members.insert(m.id, m.clone());
        }

        if should_apply.backend() {
            self.with_backend(|be| be.must_save_member(m));
        }
        self.with_store(|st| {
            st.create(&paths::member_raft_attributes(m.id), &raft_attrs_json(&m.raft_attributes));
        });

        tracing::info!(member = %m.id, peer_urls = ?m.raft_attributes.peer_urls, "added member");
        Ok(())
    }

    /// Remove a member, permanently blacklisting its id.
    pub fn remove_member(&self, id: MemberId, should_apply: ShouldApply) -> Result<(), MembershipError> {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.members.remove(&id).is_none() {
                return Err(MembershipError::IdNotFound);
            }
            inner.removed.insert(id);
        }

        if should_apply.backend() {
            self.with_backend(|be| be.must_delete_member(id));
        }
        self.with_store(|st| {
            st.delete(&paths::member(id));
            st.create(&paths::removed_member(id), "removed");
        });

        tracing::info!(member = %id, "removed member");
        Ok(())
    }

    /// Replace a member's replication attributes.
    pub fn update_raft_attributes(
        &self,
        id: MemberId,
        attrs: RaftAttributes,
        should_apply: ShouldApply,
    ) -> Result<(), MembershipError> {
        let updated = {
            let mut inner = self.inner.write().unwrap();
            if inner.removed.contains(&id) {
                return Err(MembershipError::IdRemoved);
            }
            let Some(m) = inner.members.get_mut(&id) else {
                return Err(MembershipError::IdNotFound);
            };
            m.raft_attributes = attrs;
            m.clone()
        };

        if should_apply.backend() {
            self.with_backend(|be| be.must_save_member(&updated));
        }
        self.with_store(|st| {
            st.set(
                &paths::member_raft_attributes(id),
                &raft_attrs_json(&updated.raft_attributes),
            );
        });

        tracing::info!(member = %id, "updated member raft attributes");
        Ok(())
    }

    /// Set a member's free-form attributes. Unknown members that were
    /// removed while the entry was in flight are skipped quietly.
    pub fn update_attributes(&self, id: MemberId, attrs: Attributes, should_apply: ShouldApply) {
        let updated = {
            let mut inner = self.inner.write().unwrap();
            match inner.members.get_mut(&id) {
                Some(m) => {
                    m.attributes = attrs;
                    Some(m.clone())
                }
                None => {
                    if inner.removed.contains(&id) {
                        tracing::debug!(member = %id, "skipped attributes of removed member");
                    } else {
                        tracing::warn!(member = %id, "skipped attributes of unknown member");
                    }
                    None
                }
            }
        };

        let Some(updated) = updated else { return };
        if should_apply.backend() {
            self.with_backend(|be| be.must_save_member(&updated));
        }
        self.with_store(|st| {
            st.set(&paths::member_attributes(id), &attrs_json(&updated.attributes));
        });
    }

    /// Turn a learner into a voting member.
    pub fn promote_member(&self, id: MemberId, should_apply: ShouldApply) -> Result<(), MembershipError> {
        let updated = {
            let mut inner = self.inner.write().unwrap();
            if inner.removed.contains(&id) {
                return Err(MembershipError::IdRemoved);
            }
            let Some(m) = inner.members.get_mut(&id) else {
                return Err(MembershipError::IdNotFound);
            };
            m.raft_attributes.is_learner = false;
            m.clone()
        };

        if should_apply.backend() {
            self.with_backend(|be| be.must_save_member(&updated));
        }
        self.with_store(|st| {
            st.set(
                &paths::member_raft_attributes(id),
                &raft_attrs_json(&updated.raft_attributes),
            );
        });

        tracing::info!(member = %id, "promoted learner member");
        Ok(())
    }

    /// Bump the agreed cluster version. The version only moves forward
    /// unless a downgrade is in progress. `cap_updater` refreshes the
    /// capability table with the new version.
    pub fn set_version(&self, v: SemanticVersion, cap_updater: &dyn Fn(&SemanticVersion), should_apply: ShouldApply) {
        {
            let mut inner = self.inner.write().unwrap();
            if let Some(current) = inner.version {
                if v < current && !inner.downgrade_info.enabled {
                    tracing::warn!(current = %current, proposed = %v, "refusing cluster version regression");
                    return;
                }
                tracing::info!(from = %current, to = %v, "updated cluster version");
            } else {
                tracing::info!(to = %v, "set initial cluster version");
            }
            inner.version = Some(v);
        }

        if should_apply.backend() {
            self.with_backend(|be| be.must_save_cluster_version(&v));
        }
        self.with_store(|st| st.set(paths::CLUSTER_VERSION, &v.to_string()));

        cap_updater(&v);
        self.version_changed.notify();
    }

    pub fn set_downgrade_info(&self, d: &DowngradeInfo, should_apply: ShouldApply) {
        self.inner.write().unwrap().downgrade_info = d.clone();
        if should_apply.backend() {
            self.with_backend(|be| be.must_save_downgrade_info(d));
        }
    }

    /// Check a conf change against the current view before it is recorded.
    ///
    /// # Panics
    ///
    /// Panics if an Add/Update context does not decode to a member; a
    /// malformed committed entry means the log itself is corrupt.
    pub fn validate_conf_change(&self, cc: &ConfChange) -> Result<(), MembershipError> {
        let id = MemberId(cc.node_id);
        let inner = self.inner.read().unwrap();

        if inner.removed.contains(&id) && cc.kind != ConfChangeKind::RemoveNode {
            return Err(MembershipError::IdRemoved);
        }

        match cc.kind {
            ConfChangeKind::AddNode | ConfChangeKind::AddLearnerNode => {
                let m = Member::decode(&cc.context)
                    .unwrap_or_else(|e| panic!("malformed conf change context: {e}"));
                if inner.members.contains_key(&id) {
                    return Err(MembershipError::IdExists);
                }
                if cc.kind == ConfChangeKind::AddLearnerNode {
                    let learners = inner.members.values().filter(|m| m.is_learner()).count();
                    if learners + 1 > inner.max_learners {
                        return Err(MembershipError::TooManyLearners);
                    }
                }
                Self::check_peer_urls(&inner, id, &m.raft_attributes.peer_urls)?;
            }
            ConfChangeKind::RemoveNode => {
                if !inner.members.contains_key(&id) {
                    return Err(MembershipError::IdNotFound);
                }
            }
            ConfChangeKind::UpdateNode => {
                let m = Member::decode(&cc.context)
                    .unwrap_or_else(|e| panic!("malformed conf change context: {e}"));
                if !inner.members.contains_key(&id) {
                    return Err(MembershipError::IdNotFound);
                }
                Self::check_peer_urls(&inner, id, &m.raft_attributes.peer_urls)?;
            }
            ConfChangeKind::PromoteNode => {
                let Some(m) = inner.members.get(&id) else {
                    return Err(MembershipError::IdNotFound);
                };
                if !m.is_learner() {
                    return Err(MembershipError::MemberNotLearner);
                }
            }
        }
        Ok(())
    }

    fn check_peer_urls(inner: &ClusterInner, id: MemberId, urls: &[String]) -> Result<(), MembershipError> {
        for (other_id, other) in &inner.members {
            if *other_id == id {
                continue;
            }
            if other.raft_attributes.peer_urls.iter().any(|u| urls.contains(u)) {
                return Err(MembershipError::PeerUrlExists);
            }
        }
        Ok(())
    }
}
