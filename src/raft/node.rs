//! The seam to the external consensus module.

use async_trait::async_trait;

use crate::raft::ConfChange;
use crate::raft::ConfState;
use crate::raft::Message;
use crate::raft::Ready;

/// Errors surfaced by the consensus module.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("consensus module stopped")]
    Stopped,

    #[error("proposal dropped")]
    ProposalDropped,
}

/// Outcome of streaming a snapshot to a follower, reported back so the
/// leader's replication progress can resume or retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Finish,
    Failure,
}

/// The consensus module as the server core sees it.
///
/// One long-lived task (the raft node wrapper) is the sole caller of
/// [`ready`](Self::ready) and [`advance`](Self::advance); everything else may
/// be called concurrently from client tasks.
#[async_trait]
pub trait Consensus: Send + Sync + 'static {
    /// The next batch of consensus output. Returns `None` once the module
    /// has stopped. Must not be called again before [`advance`](Self::advance)
    /// acknowledged the previous batch.
    async fn ready(&self) -> Option<Ready>;

    /// Acknowledge the last [`ready`](Self::ready) batch as fully handled.
    fn advance(&self);

    /// Drive internal timers; called every tick interval.
    fn tick(&self);

    /// Propose a normal entry.
    async fn propose(&self, data: Vec<u8>) -> Result<(), ConsensusError>;

    /// Propose a membership change.
    async fn propose_conf_change(&self, cc: ConfChange) -> Result<(), ConsensusError>;

    /// Feed a message received from a peer.
    async fn step(&self, msg: Message) -> Result<(), ConsensusError>;

    /// Record a committed membership change and return the new voting
    /// configuration. A `cc` whose `node_id` is [`NONE`](crate::raft::NONE)
    /// is recorded as a no-op while still advancing internal state.
    fn apply_conf_change(&self, cc: &ConfChange) -> ConfState;

    /// Report that a peer is unreachable so replication backs off.
    fn report_unreachable(&self, _id: u64) {}

    /// Report the outcome of a snapshot stream to a follower.
    fn report_snapshot(&self, _id: u64, _status: SnapshotStatus) {}

    /// Shut the module down; pending [`ready`](Self::ready) calls return
    /// `None`.
    fn stop(&self);
}
