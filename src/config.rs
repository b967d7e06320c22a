//! Server runtime configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::features::FeatureGate;

/// The default number of applied entries between two memory snapshots.
pub const DEFAULT_SNAPSHOT_COUNT: u64 = 100_000;

/// The default number of entries a slow follower may lag behind before it is
/// forced onto a snapshot; also the compaction safety margin.
pub const DEFAULT_SNAPSHOT_CATCH_UP_ENTRIES: u64 = 5_000;

/// Errors produced by [`ServerConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("tick-ms must be greater than 0")]
    ZeroTick,

    #[error("snapshot-count must be greater than 0")]
    ZeroSnapshotCount,

    #[error("snapshot-catch-up-entries must be greater than 0")]
    ZeroSnapshotCatchUp,

    #[error("invalid number: {invalid:?}: {reason}")]
    InvalidNumber { invalid: String, reason: String },

    #[error("max-request-bytes {given} exceeds the hard limit {limit}")]
    RequestBytesTooLarge { given: u64, limit: u64 },

    #[error("invalid feature gate: {0}")]
    InvalidFeatureGate(String),
}

/// Parse a byte count with an optional unit such as `1.5 MB`.
fn parse_bytes_with_unit(src: &str) -> Result<u64, ConfigError> {
    let res = byte_unit::Byte::from_str(src).map_err(|e| ConfigError::InvalidNumber {
        invalid: src.to_string(),
        reason: e.to_string(),
    })?;

    Ok(res.as_u64())
}

/// Hard cap on `max_request_bytes`; a single entry must fit comfortably in a
/// raft message.
const MAX_REQUEST_BYTES_LIMIT: u64 = 512 * 1024 * 1024;

/// Runtime configuration for the server core.
///
/// Create a configuration, customize fields, then [`validate`](Self::validate)
/// it before handing it to the server.
#[derive(Clone, Debug, PartialEq, Parser)]
pub struct ServerConfig {
    /// Human-readable name of this member, published to the cluster.
    #[clap(long, default_value = "default")]
    pub name: String,

    /// Directory holding the member's snapshot and backend files.
    #[clap(long, default_value = "quorumkv.data")]
    pub data_dir: PathBuf,

    /// Raft tick period in milliseconds. The liveness probe treats the raft
    /// loop as active while the last tick is younger than `3 * tick_ms`.
    #[clap(long, default_value = "100")]
    pub tick_ms: u64,

    /// Number of applied entries between two memory snapshots.
    #[clap(long, default_value = "100000")]
    pub snapshot_count: u64,

    /// Applied-entry delta that forces a disk snapshot, and the number of
    /// entries kept in the raft log when compacting after one.
    #[clap(long, default_value = "5000")]
    pub snapshot_catch_up_entries: u64,

    /// Maximum size of a single proposal payload.
    #[clap(long, default_value = "1.5 MB", value_parser = parse_bytes_with_unit)]
    pub max_request_bytes: u64,

    /// Backend size quota; writes beyond it raise the NOSPACE alarm. 0
    /// disables the check.
    #[clap(long, default_value = "2 GB", value_parser = parse_bytes_with_unit)]
    pub quota_backend_bytes: u64,

    /// Client URLs published with this member's attributes.
    #[clap(long)]
    pub client_urls: Vec<String>,

    /// Wall-clock deadline for a proposal to come back through the apply
    /// pipeline.
    #[clap(long, default_value = "7000")]
    pub request_timeout_ms: u64,

    /// Deadline for `wait_applied_index`, in milliseconds.
    #[clap(long, default_value = "5000")]
    pub wait_applied_index_timeout_ms: u64,

    /// Per-attempt deadline for publishing this member's attributes.
    #[clap(long, default_value = "7000")]
    pub publish_timeout_ms: u64,

    /// Feature gates, as `Name=true,Other=false`.
    #[clap(long, default_value = "")]
    pub feature_gates: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        <Self as Parser>::parse_from(["quorumkv"])
    }
}

impl ServerConfig {
    /// Validate the configuration and reject values the apply pipeline cannot
    /// run with.
    pub fn validate(self) -> Result<ServerConfig, ConfigError> {
        if self.tick_ms == 0 {
            return Err(ConfigError::ZeroTick);
        }
        if self.snapshot_count == 0 {
            return Err(ConfigError::ZeroSnapshotCount);
        }
        if self.snapshot_catch_up_entries == 0 {
            return Err(ConfigError::ZeroSnapshotCatchUp);
        }
        if self.max_request_bytes > MAX_REQUEST_BYTES_LIMIT {
            return Err(ConfigError::RequestBytesTooLarge {
                given: self.max_request_bytes,
                limit: MAX_REQUEST_BYTES_LIMIT,
            });
        }

        Ok(self)
    }

    /// Build the server feature gate from the configured `feature_gates`
    /// string.
    pub fn server_feature_gate(&self) -> Result<FeatureGate, ConfigError> {
        let gate = FeatureGate::new_default(&self.name);
        if !self.feature_gates.is_empty() {
            gate.set(&self.feature_gates).map_err(|e| ConfigError::InvalidFeatureGate(e.to_string()))?;
        }
        Ok(gate)
    }

    /// Directory where snapshot files and the live DB live.
    pub fn snap_dir(&self) -> PathBuf {
        self.data_dir.join("member").join("snap")
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn wait_applied_index_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_applied_index_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
