//! Typed accessors over the backend buckets.
//!
//! Key names in the `meta` and `cluster` buckets are part of the on-disk
//! schema; the encodings are: 8-byte big-endian for the consistent index and
//! term, JSON for structured records.

use std::sync::Arc;

use crate::membership::DowngradeInfo;
use crate::membership::Member;
use crate::raft::ConfState;
use crate::storage::Backend;
use crate::storage::BatchTx;
use crate::storage::Bucket;
use crate::storage::ReadTx;
use crate::storage::TxReader;
use crate::types::MemberId;
use crate::version::SemanticVersion;

pub const META_CONSISTENT_INDEX_KEY: &[u8] = b"consistent_index";
pub const META_TERM_KEY: &[u8] = b"term";
pub const META_CONF_STATE_KEY: &[u8] = b"confState";
pub const CLUSTER_VERSION_KEY: &[u8] = b"clusterVersion";
pub const CLUSTER_DOWNGRADE_KEY: &[u8] = b"downgrade";

fn decode_u64(value: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&value[..8]);
    u64::from_be_bytes(buf)
}

/// Read `(term, index)` of the consistent-index cursor from a read
/// transaction. Missing keys read as zero (fresh backend).
pub fn read_consistent_index(tx: &ReadTx<'_>) -> (u64, u64) {
    let index = tx.unsafe_get(Bucket::Meta, META_CONSISTENT_INDEX_KEY).map(|v| decode_u64(&v)).unwrap_or(0);
    let term = tx.unsafe_get(Bucket::Meta, META_TERM_KEY).map(|v| decode_u64(&v)).unwrap_or(0);
    (term, index)
}

/// Write the consistent-index cursor inside an open batch transaction.
pub fn unsafe_update_consistent_index(tx: &mut BatchTx<'_>, term: u64, index: u64) {
    tx.unsafe_put(Bucket::Meta, META_CONSISTENT_INDEX_KEY, &index.to_be_bytes());
    tx.unsafe_put(Bucket::Meta, META_TERM_KEY, &term.to_be_bytes());
}

pub fn unsafe_save_conf_state(tx: &mut BatchTx<'_>, conf_state: &ConfState) {
    let value = serde_json::to_vec(conf_state).expect("conf state serializes");
    tx.unsafe_put(Bucket::Meta, META_CONF_STATE_KEY, &value);
}

pub fn conf_state_from_backend(tx: &ReadTx<'_>) -> Option<ConfState> {
    let value = tx.unsafe_get(Bucket::Meta, META_CONF_STATE_KEY)?;
    Some(serde_json::from_slice(&value).expect("conf state in meta bucket is well formed"))
}

/// Membership records in the backend. The backend is the authoritative copy
/// of the member view across restarts.
#[derive(Debug, Clone)]
pub struct MembershipBackend {
    be: Arc<Backend>,
}

impl MembershipBackend {
    pub fn new(be: Arc<Backend>) -> Self {
        Self { be }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.be
    }

    pub fn must_save_member(&self, m: &Member) {
        let key = m.id.to_string();
        let value = serde_json::to_vec(m).expect("member record serializes");
        let mut tx = self.be.batch_tx();
        tx.unsafe_put(Bucket::Members, key.as_bytes(), &value);
        tx.commit();
    }

    /// Delete a member record and remember the id in the removed bucket.
    pub fn must_delete_member(&self, id: MemberId) {
        let key = id.to_string();
        let mut tx = self.be.batch_tx();
        tx.unsafe_delete(Bucket::Members, key.as_bytes());
        tx.unsafe_put(Bucket::MembersRemoved, key.as_bytes(), b"removed");
        tx.commit();
    }

    /// Load `(members, removed_ids)` from the backend.
    pub fn members_from_backend(&self) -> (Vec<Member>, Vec<MemberId>) {
        let tx = self.be.read_tx();

        let members = tx
            .unsafe_range(Bucket::Members, &[], Some(&[0]), 0)
            .into_iter()
            .map(|(k, v)| {
                serde_json::from_slice(&v).unwrap_or_else(|e| {
                    panic!("malformed member record {:?}: {}", String::from_utf8_lossy(&k), e)
                })
            })
            .collect();

        let removed = tx
            .unsafe_range(Bucket::MembersRemoved, &[], Some(&[0]), 0)
            .into_iter()
            .filter_map(|(k, _)| String::from_utf8(k).ok()?.parse().ok())
            .collect();

        (members, removed)
    }

    pub fn must_save_cluster_version(&self, v: &SemanticVersion) {
        let mut tx = self.be.batch_tx();
        tx.unsafe_put(Bucket::Cluster, CLUSTER_VERSION_KEY, v.to_string().as_bytes());
        tx.commit();
    }

    pub fn cluster_version_from_backend(&self) -> Option<SemanticVersion> {
        let value = self.be.read_tx().unsafe_get(Bucket::Cluster, CLUSTER_VERSION_KEY)?;
        String::from_utf8(value).ok()?.parse().ok()
    }

    pub fn must_save_downgrade_info(&self, d: &DowngradeInfo) {
        let value = serde_json::to_vec(d).expect("downgrade info serializes");
        let mut tx = self.be.batch_tx();
        tx.unsafe_put(Bucket::Cluster, CLUSTER_DOWNGRADE_KEY, &value);
        tx.commit();
    }

    pub fn downgrade_info_from_backend(&self) -> Option<DowngradeInfo> {
        let value = self.be.read_tx().unsafe_get(Bucket::Cluster, CLUSTER_DOWNGRADE_KEY)?;
        serde_json::from_slice(&value).ok()
    }
}
