//! Types exchanged with the consensus module.

use serde::Deserialize;
use serde::Serialize;

/// The absent node id. A conf change whose `node_id` is rewritten to `NONE`
/// is recorded by consensus as a no-op; outgoing messages addressed to `NONE`
/// are dropped.
pub const NONE: u64 = 0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    #[default]
    Normal,
    ConfChange,
}

/// A single log entry. The apply engine observes entries with strictly
/// increasing `index`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

/// Durable consensus state, persisted before messages referring to it leave
/// the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

impl HardState {
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateRole {
    Follower,
    Candidate,
    Leader,
}

/// Volatile consensus state: current leader and this node's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftState {
    pub lead: u64,
    pub raft_state: StateRole,
}

/// The voting configuration recorded alongside snapshots and the meta bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfState {
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeKind {
    AddNode,
    AddLearnerNode,
    RemoveNode,
    UpdateNode,
    PromoteNode,
}

impl Default for ConfChangeKind {
    fn default() -> Self {
        ConfChangeKind::AddNode
    }
}

/// A membership mutation travelling through the log.
///
/// `context` carries the JSON-encoded member for Add/Update/Promote; `id`
/// wakes the proposer's waiter once the change is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub id: u64,
    pub kind: ConfChangeKind,
    pub node_id: u64,
    pub context: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub index: u64,
    pub term: u64,
    pub conf_state: ConfState,
}

/// A point-in-time state machine image plus the log position it covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.metadata.index == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Append,
    AppendResponse,
    Vote,
    VoteResponse,
    Heartbeat,
    HeartbeatResponse,
    Snapshot,
}

/// A peer-to-peer consensus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub to: u64,
    pub from: u64,
    pub term: u64,
    pub index: u64,
    pub commit: u64,
    pub entries: Vec<Entry>,
    pub snapshot: Option<Snapshot>,
}

impl Message {
    pub fn new(kind: MessageKind, to: u64, from: u64) -> Self {
        Self {
            kind,
            to,
            from,
            term: 0,
            index: 0,
            commit: 0,
            entries: Vec::new(),
            snapshot: None,
        }
    }
}

/// One batch of consensus output: state to persist, messages to send, and
/// committed entries to apply. Consumed by the raft node wrapper, which must
/// call [`Consensus::advance`](crate::raft::Consensus::advance) when done.
#[derive(Debug, Clone, Default)]
pub struct Ready {
    pub soft_state: Option<SoftState>,
    pub hard_state: Option<HardState>,
    pub entries: Vec<Entry>,
    pub snapshot: Option<Snapshot>,
    pub committed_entries: Vec<Entry>,
    pub messages: Vec<Message>,
}
