//! The consensus seam and the raft node wrapper.
//!
//! The consensus algorithm itself lives outside this crate behind the
//! [`Consensus`] trait; this module defines the wire-level types it exchanges
//! ([`Ready`], [`Entry`], [`Message`], ...), an in-memory raft log
//! ([`MemRaftLog`]) the wrapper feeds, and the [`RaftNode`] wrapper that
//! drains the `Ready` stream into the apply loop.

mod message;
mod node;
mod raft_node;
mod storage;

pub use self::message::ConfChange;
pub use self::message::ConfChangeKind;
pub use self::message::ConfState;
pub use self::message::Entry;
pub use self::message::EntryKind;
pub use self::message::HardState;
pub use self::message::Message;
pub use self::message::MessageKind;
pub use self::message::Ready;
pub use self::message::Snapshot;
pub use self::message::SnapshotMetadata;
pub use self::message::SoftState;
pub use self::message::StateRole;
pub use self::message::NONE;
pub use self::node::Consensus;
pub use self::node::ConsensusError;
pub use self::node::SnapshotStatus;
pub use self::raft_node::RaftNode;
pub use self::raft_node::RaftNodeConfig;
pub use self::raft_node::ReadyHandler;
pub use self::raft_node::ToApply;
pub use self::storage::MemRaftLog;
pub use self::storage::RaftLogError;
