//! `quorumkv` is the server core of a replicated key-value store: the apply
//! and membership pipeline that sits between a consensus module (producing an
//! ordered log of entries) and a transactional bucketed key-value backend.
//!
//! The crate turns each consensus-emitted [`raft::Ready`] into durable,
//! linearizable state machine effects:
//!
//! - the [`raft::RaftNode`] wrapper drains the `Ready` stream, persists hard
//!   state and entries, fans out peer messages, and hands committed entries to
//!   the apply loop over a capacity-1 channel;
//! - the apply path in [`server::Server`] applies normal and conf-change
//!   entries exactly once, gated by the persisted consistent-index cursor in
//!   [`cindex`];
//! - [`membership::RaftCluster`] holds the member view, mirrored into the
//!   backend and the legacy hierarchical store;
//! - the snapshot coordinator decides when to snapshot memory and disk, and
//!   enforces the snapshot-before-DB-swap ordering with [`snap::Snapshotter`];
//! - [`wait`] wakes proposal issuers with per-request results.
//!
//! The consensus module itself and the peer transport are external: they plug
//! in through the [`raft::Consensus`] and [`transport::Transport`] traits.

#![deny(unused_qualifications)]

pub mod alarm;
pub mod apply;
pub mod auth;
pub mod capability;
pub mod cindex;
pub mod config;
pub mod errors;
pub mod features;
pub mod id_gen;
pub mod lease;
pub mod membership;
pub mod mvcc;
pub mod notify;
pub mod raft;
pub mod server;
pub mod snap;
pub mod storage;
pub mod testing;
pub mod transport;
pub mod types;
pub mod version;
pub mod wait;

pub use crate::config::ServerConfig;
pub use crate::errors::ServerError;
pub use crate::server::Server;
pub use crate::types::MemberId;
