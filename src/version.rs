//! Cluster version handling.
//!
//! The cluster version is the lowest common denominator of the versions the
//! members run. It only ever moves forward (except through an explicit
//! downgrade), and it gates which capabilities the server enables.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Version of the local server binary.
pub const SERVER_VERSION: SemanticVersion = SemanticVersion {
    major: 3,
    minor: 6,
    patch: 0,
};

/// The cluster version this binary proposes when bootstrapping a cluster.
pub fn cluster_version() -> SemanticVersion {
    SemanticVersion {
        patch: 0,
        ..SERVER_VERSION
    }
}

/// A `major.minor.patch` version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SemanticVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemanticVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// The version with the patch level cleared, used for cluster-wide
    /// comparisons: two servers are compatible iff their `major.minor` match.
    pub fn minor_version(&self) -> SemanticVersion {
        SemanticVersion { patch: 0, ..*self }
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error parsing a semantic version string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version string: {invalid:?}")]
pub struct InvalidVersion {
    pub invalid: String,
}

impl FromStr for SemanticVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidVersion { invalid: s.to_string() };

        let mut parts = s.split('.');
        let mut next = |parts: &mut std::str::Split<'_, char>| -> Result<u64, InvalidVersion> {
            parts.next().ok_or_else(invalid)?.parse::<u64>().map_err(|_| invalid())
        };

        let major = next(&mut parts)?;
        let minor = next(&mut parts)?;
        let patch = next(&mut parts)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(SemanticVersion { major, minor, patch })
    }
}

#[cfg(test)]
mod tests {
    use super::SemanticVersion;

    #[test]
    fn test_parse_and_display() -> anyhow::Result<()> {
        let v: SemanticVersion = "3.5.12".parse()?;
        assert_eq!(SemanticVersion::new(3, 5, 12), v);
        assert_eq!("3.5.12", v.to_string());

        assert!("3.5".parse::<SemanticVersion>().is_err());
        assert!("3.5.1.2".parse::<SemanticVersion>().is_err());
        assert!("a.b.c".parse::<SemanticVersion>().is_err());
        Ok(())
    }

    #[test]
    fn test_ordering() -> anyhow::Result<()> {
        let old: SemanticVersion = "3.4.0".parse()?;
        let new: SemanticVersion = "3.5.0".parse()?;
        assert!(old < new);
        assert_eq!(new.minor_version(), "3.5.7".parse::<SemanticVersion>()?.minor_version());
        Ok(())
    }
}
