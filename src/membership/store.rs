//! The legacy hierarchical store mirror.
//!
//! A compatibility artifact: membership mutations are mirrored into a
//! path-keyed store so older tooling can read them. It is a write-only sink
//! during apply; reads are never served from it, and it is rebuilt from the
//! backend on every boot.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::types::MemberId;

/// Store paths used by the membership mirror.
pub mod paths {
    use super::MemberId;

    pub const CLUSTER_VERSION: &str = "/0/version";

    pub fn member(id: MemberId) -> String {
        format!("/0/members/{id}")
    }

    pub fn member_raft_attributes(id: MemberId) -> String {
        format!("/0/members/{id}/raftAttributes")
    }

    pub fn member_attributes(id: MemberId) -> String {
        format!("/0/members/{id}/attributes")
    }

    pub fn removed_member(id: MemberId) -> String {
        format!("/0/removed_members/{id}")
    }
}

/// The write-only sink the membership view mirrors into.
pub trait LegacyStore: Send + Sync {
    /// Create a value at `path`; overwrites silently, creation conflicts are
    /// not interesting to a mirror.
    fn create(&self, path: &str, value: &str);

    fn set(&self, path: &str, value: &str);

    /// Delete `path` and everything below it.
    fn delete(&self, path: &str);
}

/// In-memory hierarchical store.
#[derive(Debug, Default)]
pub struct HierStore {
    nodes: Mutex<BTreeMap<String, String>>,
}

impl HierStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read back a mirrored value. Test-facing; the server never reads the
    /// mirror.
    pub fn get(&self, path: &str) -> Option<String> {
        self.nodes.lock().unwrap().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().unwrap().is_empty()
    }
}

impl LegacyStore for HierStore {
    fn create(&self, path: &str, value: &str) {
        self.nodes.lock().unwrap().insert(path.to_string(), value.to_string());
    }

    fn set(&self, path: &str, value: &str) {
        self.nodes.lock().unwrap().insert(path.to_string(), value.to_string());
    }

    fn delete(&self, path: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        let prefix = format!("{path}/");
        nodes.retain(|k, _| k != path && !k.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_removes_subtree() {
        let st = HierStore::new();
        st.create("/0/members/a", "m");
        st.create("/0/members/a/raftAttributes", "r");
        st.create("/0/members/b", "keep");

        st.delete("/0/members/a");
        assert_eq!(None, st.get("/0/members/a"));
        assert_eq!(None, st.get("/0/members/a/raftAttributes"));
        assert_eq!(Some("keep".to_string()), st.get("/0/members/b"));
    }
}
