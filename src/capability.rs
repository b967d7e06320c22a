//! Capabilities enabled by the agreed cluster version.
//!
//! A capability turns on once every member runs a version that supports it;
//! the table refreshes whenever the cluster version is bumped.

use std::collections::BTreeSet;
use std::sync::RwLock;

use crate::version::SemanticVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Capability {
    /// The modern request surface.
    V3Rpc,
    /// Auth over the modern surface.
    AuthV3,
    /// Learner members and promotion.
    Learner,
    /// Recorded downgrades.
    Downgrade,
}

fn capabilities_for(v: &SemanticVersion) -> Vec<Capability> {
    let mut caps = Vec::new();
    if (v.major, v.minor) >= (3, 0) {
        caps.push(Capability::V3Rpc);
        caps.push(Capability::AuthV3);
    }
    if (v.major, v.minor) >= (3, 4) {
        caps.push(Capability::Learner);
    }
    if (v.major, v.minor) >= (3, 6) {
        caps.push(Capability::Downgrade);
    }
    caps
}

/// The per-server capability table.
#[derive(Debug, Default)]
pub struct CapabilityTable {
    enabled: RwLock<BTreeSet<Capability>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh for a newly agreed cluster version.
    pub fn update_for_version(&self, v: &SemanticVersion) {
        let caps: BTreeSet<Capability> = capabilities_for(v).into_iter().collect();
        tracing::info!(version = %v, "enabled capabilities for version");
        *self.enabled.write().unwrap() = caps;
    }

    pub fn is_enabled(&self, c: Capability) -> bool {
        self.enabled.read().unwrap().contains(&c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_follow_version() {
        let table = CapabilityTable::new();
        assert!(!table.is_enabled(Capability::V3Rpc));

        table.update_for_version(&"3.4.0".parse().unwrap());
        assert!(table.is_enabled(Capability::V3Rpc));
        assert!(table.is_enabled(Capability::Learner));
        assert!(!table.is_enabled(Capability::Downgrade));

        table.update_for_version(&"3.6.0".parse().unwrap());
        assert!(table.is_enabled(Capability::Downgrade));
    }
}
