//! Server feature gates.
//!
//! A feature gate is a named boolean with a maturity stage. Gates are
//! populated at construction, may be overridden from configuration before the
//! server starts, and are immutable afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Allow promoting a learner member once it has caught up with the leader.
pub const MEMBER_PROMOTE: &str = "MemberPromote";

/// Allow recording cluster downgrade information.
pub const DOWNGRADE: &str = "Downgrade";

/// Maturity stage of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Alpha,
    Beta,
    /// Generally available. A GA feature that defaults to enabled may not be
    /// disabled.
    Ga,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Alpha => write!(f, "ALPHA"),
            Stage::Beta => write!(f, "BETA"),
            Stage::Ga => Ok(()),
        }
    }
}

/// Definition of a single feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSpec {
    pub default: bool,
    pub stage: Stage,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeatureGateError {
    #[error("feature gate is closed for modification")]
    Closed,

    #[error("unrecognized feature gate: {0}")]
    Unknown(String),

    #[error("feature {0} is already registered with a different spec")]
    AlreadyRegistered(String),

    #[error("feature {0} is GA and enabled by default, it may not be disabled")]
    CannotDisableGa(String),

    #[error("invalid feature gate syntax: {0:?}, expect Name=true|false")]
    InvalidSyntax(String),
}

#[derive(Debug, Default)]
struct Inner {
    closed: bool,
    specs: HashMap<String, FeatureSpec>,
    enabled: HashMap<String, bool>,
}

/// A set of feature gates.
///
/// Lookup with [`enabled`](Self::enabled) is cheap; mutation is rejected once
/// the gate is [`close`](Self::close)d, which the server does when it starts.
#[derive(Debug)]
pub struct FeatureGate {
    name: String,
    inner: RwLock<Inner>,
}

impl FeatureGate {
    /// An empty gate; features are registered with [`add`](Self::add).
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// A gate pre-populated with the server's known features.
    pub fn new_default(name: impl ToString) -> Self {
        let gate = Self::new(name);
        gate.add(HashMap::from([
            (
                MEMBER_PROMOTE.to_string(),
                FeatureSpec {
                    default: true,
                    stage: Stage::Beta,
                },
            ),
            (
                DOWNGRADE.to_string(),
                FeatureSpec {
                    default: false,
                    stage: Stage::Alpha,
                },
            ),
        ]))
        .expect("default features on a fresh gate");
        gate
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register features. Re-registering an existing feature with a different
    /// spec is rejected.
    pub fn add(&self, features: HashMap<String, FeatureSpec>) -> Result<(), FeatureGateError> {
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return Err(FeatureGateError::Closed);
        }
        for (name, spec) in features {
            if let Some(existing) = inner.specs.get(&name) {
                if *existing != spec {
                    return Err(FeatureGateError::AlreadyRegistered(name));
                }
                continue;
            }
            inner.specs.insert(name, spec);
        }
        Ok(())
    }

    /// Apply overrides from a `Name=true,Other=false` string.
    pub fn set(&self, overrides: &str) -> Result<(), FeatureGateError> {
        let mut map = HashMap::new();
        for pair in overrides.split(',').filter(|s| !s.is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| FeatureGateError::InvalidSyntax(pair.to_string()))?;
            let value = value
                .trim()
                .parse::<bool>()
                .map_err(|_| FeatureGateError::InvalidSyntax(pair.to_string()))?;
            map.insert(name.trim().to_string(), value);
        }
        self.set_from_map(map)
    }

    /// Apply overrides from a map.
    pub fn set_from_map(&self, overrides: HashMap<String, bool>) -> Result<(), FeatureGateError> {
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return Err(FeatureGateError::Closed);
        }
        for (name, value) in &overrides {
            let spec = inner.specs.get(name).ok_or_else(|| FeatureGateError::Unknown(name.clone()))?;
            if spec.stage == Stage::Ga && spec.default && !value {
                return Err(FeatureGateError::CannotDisableGa(name.clone()));
            }
        }
        inner.enabled.extend(overrides);
        Ok(())
    }

    /// Whether a feature is enabled.
    ///
    /// # Panics
    ///
    /// Panics if the feature was never registered; querying an unknown gate
    /// is a programming error.
    pub fn enabled(&self, feature: &str) -> bool {
        let inner = self.inner.read().unwrap();
        if let Some(v) = inner.enabled.get(feature) {
            return *v;
        }
        match inner.specs.get(feature) {
            Some(spec) => spec.default,
            None => panic!("feature {:?} is not registered in gate {:?}", feature, self.name),
        }
    }

    /// Reject all further modification. Called when the server starts.
    pub fn close(&self) {
        self.inner.write().unwrap().closed = true;
    }
}
