//! The peer transport seam.
//!
//! The transport delivers consensus messages and streams snapshots between
//! members. It lives outside this crate; the raft node wrapper only needs
//! these two entry points plus a stop hook. Inbound messages arrive through
//! [`Server::process`](crate::server::Server::process).

use crate::raft::Message;
use crate::raft::Snapshot;

/// A snapshot handed to the transport for streaming: the consensus message
/// announcing it plus the DB image the receiver stages on disk.
#[derive(Debug, Clone)]
pub struct SnapMessage {
    pub message: Message,
    pub db: Vec<u8>,
}

impl SnapMessage {
    pub fn snapshot(&self) -> &Snapshot {
        self.message.snapshot.as_ref().expect("snapshot message carries a snapshot")
    }
}

/// Message fan-out to peers.
///
/// Sends are non-blocking; a congested peer drops messages and the drop is
/// reported asynchronously through the consensus module's unreachable /
/// snapshot-status hooks. Messages addressed to node 0 are dropped silently.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, msgs: Vec<Message>);

    fn send_snapshot(&self, m: SnapMessage);

    fn stop(&self) {}
}
