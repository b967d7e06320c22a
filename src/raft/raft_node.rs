//! The raft node wrapper: drains the consensus `Ready` stream.
//!
//! One long-lived task consumes every `Ready`, in this order: soft-state
//! bookkeeping, hand-off of committed entries to the apply loop (capacity-1
//! channel, the backpressure point), snapshot record to disk *before* the
//! log save and sync, a `notifyc` handshake that releases the applier to
//! claim a staged DB image, message fan-out, `advance()`, and finally the
//! `raft_advanced` signal the applier waits on at the end of a batch.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing_futures::Instrument;

use crate::notify::Closer;
use crate::raft::Consensus;
use crate::raft::Entry;
use crate::raft::MemRaftLog;
use crate::raft::Message;
use crate::raft::MessageKind;
use crate::raft::Ready;
use crate::raft::Snapshot;
use crate::raft::StateRole;
use crate::raft::NONE;
use crate::storage::PersistentStorage;
use crate::transport::Transport;

/// In-flight snapshot messages buffered towards the server loop.
const MAX_IN_FLIGHT_MSG_SNAP: usize = 16;

/// Callbacks into the server. The wrapper deliberately sees only this
/// capability, not the server itself.
pub trait ReadyHandler: Send + Sync + 'static {
    fn update_lead(&self, lead: u64);

    /// `new_leader` is true when leadership moved to a different node (not
    /// merely was confirmed).
    fn update_leadership(&self, new_leader: bool);

    fn update_committed_index(&self, committed_index: u64);

    fn is_id_removed(&self, id: u64) -> bool;
}

/// One batch of committed state for the apply loop.
#[derive(Debug)]
pub struct ToApply {
    pub entries: Vec<Entry>,
    pub snapshot: Option<Snapshot>,

    /// Persistence handshake. Signalled once the batch's state is on disk;
    /// for snapshot batches an extra early signal releases the staged DB
    /// image (receive it in the snapshot path before touching the DB).
    pub notifyc: mpsc::Receiver<()>,

    /// Signalled after `advance()`; the applier waits on it at batch end.
    pub raft_advanced: mpsc::Receiver<()>,
}

pub struct RaftNodeConfig {
    pub node: Arc<dyn Consensus>,
    /// Tick period (the configured `tick_ms`).
    pub heartbeat: Duration,
    pub raft_storage: Arc<MemRaftLog>,
    pub storage: Arc<dyn PersistentStorage>,
    pub transport: Arc<dyn Transport>,
}

/// The wrapper. Owns the pump task; everything else holds it behind the
/// server.
pub struct RaftNode {
    node: Arc<dyn Consensus>,
    heartbeat: Duration,
    raft_storage: Arc<MemRaftLog>,
    storage: Arc<dyn PersistentStorage>,
    transport: Arc<dyn Transport>,

    /// Guards the liveness timestamp (`tick_mu`).
    latest_tick: Arc<RwLock<Instant>>,

    stopped: Closer,
    done: Closer,
}

impl RaftNode {
    pub fn new(cfg: RaftNodeConfig) -> Self {
        Self {
            node: cfg.node,
            heartbeat: cfg.heartbeat,
            raft_storage: cfg.raft_storage,
            storage: cfg.storage,
            transport: cfg.transport,
            latest_tick: Arc::new(RwLock::new(Instant::now())),
            stopped: Closer::new(),
            done: Closer::new(),
        }
    }

    pub fn node(&self) -> &Arc<dyn Consensus> {
        &self.node
    }

    pub fn raft_storage(&self) -> &Arc<MemRaftLog> {
        &self.raft_storage
    }

    pub fn storage(&self) -> &Arc<dyn PersistentStorage> {
        &self.storage
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Drive consensus timers and refresh the liveness timestamp.
    pub fn tick(&self) {
        *self.latest_tick.write().unwrap() = Instant::now();
        self.node.tick();
    }

    pub fn latest_tick(&self) -> Instant {
        *self.latest_tick.read().unwrap()
    }

    #[cfg(test)]
    pub(crate) fn set_latest_tick(&self, t: Instant) {
        *self.latest_tick.write().unwrap() = t;
    }

    /// Spawn the ready pump. Returns the apply channel (capacity 1) and the
    /// channel surfacing outgoing snapshot messages to the server loop.
    pub(crate) fn start(&self, rh: Arc<dyn ReadyHandler>) -> (mpsc::Receiver<ToApply>, mpsc::Receiver<Message>) {
        let (apply_tx, apply_rx) = mpsc::channel(1);
        let (msg_snap_tx, msg_snap_rx) = mpsc::channel(MAX_IN_FLIGHT_MSG_SNAP);

        let pump = Pump {
            node: self.node.clone(),
            heartbeat: self.heartbeat,
            raft_storage: self.raft_storage.clone(),
            storage: self.storage.clone(),
            transport: self.transport.clone(),
            latest_tick: self.latest_tick.clone(),
            stopped: self.stopped.clone(),
            done: self.done.clone(),
            rh,
            apply_tx,
            msg_snap_tx,
        };
        tokio::spawn(pump.run().instrument(tracing::info_span!("raft_pump")));

        (apply_rx, msg_snap_rx)
    }

    /// Stop the pump and the consensus module, then wait for the pump to
    /// exit.
    pub async fn stop(&self) {
        if !self.stopped.close() {
            self.done.closed().await;
            return;
        }
        self.node.stop();
        self.transport.stop();
        if let Err(e) = self.storage.close() {
            tracing::error!("failed to close raft storage: {}", e);
        }
        self.done.closed().await;
    }
}

struct Pump {
    node: Arc<dyn Consensus>,
    heartbeat: Duration,
    raft_storage: Arc<MemRaftLog>,
    storage: Arc<dyn PersistentStorage>,
    transport: Arc<dyn Transport>,
    latest_tick: Arc<RwLock<Instant>>,
    stopped: Closer,
    done: Closer,
    rh: Arc<dyn ReadyHandler>,
    apply_tx: mpsc::Sender<ToApply>,
    msg_snap_tx: mpsc::Sender<Message>,
}

impl Pump {
    async fn run(self) {
        // A zero heartbeat disables ticking; tests drive the node directly.
        let heartbeat = if self.heartbeat.is_zero() {
            Duration::from_secs(365 * 24 * 3600)
        } else {
            self.heartbeat
        };
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it.
        ticker.tick().await;

        let mut islead = false;
        let mut lead = NONE;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    *self.latest_tick.write().unwrap() = Instant::now();
                    self.node.tick();
                }
                _ = self.stopped.closed() => break,
                maybe_rd = self.node.ready() => {
                    let Some(rd) = maybe_rd else { break };
                    if !self.handle_ready(rd, &mut islead, &mut lead).await {
                        break;
                    }
                }
            }
        }
        self.done.close();
        tracing::info!("raft pump stopped");
    }

    /// Returns false when the pump should stop.
    async fn handle_ready(&self, mut rd: Ready, islead: &mut bool, lead: &mut u64) -> bool {
        if let Some(ss) = &rd.soft_state {
            let new_leader = ss.lead != NONE && *lead != ss.lead;
            *lead = ss.lead;
            *islead = ss.raft_state == StateRole::Leader;
            self.rh.update_lead(ss.lead);
            self.rh.update_leadership(new_leader);
        }

        let (notify_tx, notify_rx) = mpsc::channel(1);
        let (advanced_tx, advanced_rx) = mpsc::channel(1);
        let ap = ToApply {
            entries: rd.committed_entries.clone(),
            snapshot: rd.snapshot.clone(),
            notifyc: notify_rx,
            raft_advanced: advanced_rx,
        };
        if let Some(ci) = committed_index_of(&ap) {
            self.rh.update_committed_index(ci);
        }

        tokio::select! {
            res = self.apply_tx.send(ap) => {
                if res.is_err() {
                    return false;
                }
            }
            _ = self.stopped.closed() => return false,
        }

        let mut pending_msgs = Some(std::mem::take(&mut rd.messages));

        // The leader may fan out before persisting; followers must persist
        // first so acknowledged state is durable.
        if *islead {
            let msgs = self.process_messages(pending_msgs.take().unwrap_or_default());
            self.transport.send(msgs);
        }

        if let Some(snapshot) = &rd.snapshot {
            // Snapshot ordering invariant: the snapshot record reaches disk
            // before anyone may swap the staged DB in.
            if let Err(e) = self.storage.save_snap(snapshot) {
                panic!("failed to save raft snapshot: {e}");
            }
        }
        if let Err(e) = self.storage.save(rd.hard_state.as_ref(), &rd.entries) {
            panic!("failed to save raft hard state and entries: {e}");
        }
        if let Some(snapshot) = &rd.snapshot {
            if let Err(e) = self.storage.sync() {
                panic!("failed to sync raft storage: {e}");
            }

            // The applier may now claim the staged DB image.
            let _ = notify_tx.send(()).await;

            self.raft_storage.apply_snapshot(snapshot);
            if let Err(e) = self.storage.release(snapshot) {
                tracing::error!("failed to release old snapshots: {}", e);
            }
        }
        self.raft_storage.append(&rd.entries);

        if let Some(msgs) = pending_msgs {
            let msgs = self.process_messages(msgs);
            let _ = notify_tx.send(()).await;
            self.transport.send(msgs);
        } else {
            let _ = notify_tx.send(()).await;
        }

        self.node.advance();
        let _ = advanced_tx.try_send(());
        true
    }

    fn process_messages(&self, mut msgs: Vec<Message>) -> Vec<Message> {
        for m in msgs.iter_mut() {
            if self.rh.is_id_removed(m.to) {
                m.to = NONE;
            }
            if m.kind == MessageKind::Snapshot && m.to != NONE {
                // Snapshot sends go through the server loop, which merges
                // the current state machine image in.
                match self.msg_snap_tx.try_send(m.clone()) {
                    Ok(()) => {}
                    Err(_) => {
                        tracing::warn!(to = m.to, "dropped snapshot message, sending buffer is full");
                    }
                }
                m.to = NONE;
            }
        }
        msgs
    }
}

fn committed_index_of(ap: &ToApply) -> Option<u64> {
    let mut ci = ap.entries.last().map(|e| e.index).unwrap_or(0);
    if let Some(snapshot) = &ap.snapshot {
        ci = ci.max(snapshot.metadata.index);
    }
    (ci != 0).then_some(ci)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::raft::MemRaftLog;
    use crate::raft::RaftNodeConfig;
    use crate::testing::CountingTransport;
    use crate::testing::NodeRecorder;
    use crate::testing::StorageRecorder;

    struct RemovedNineHandler;

    impl ReadyHandler for RemovedNineHandler {
        fn update_lead(&self, _lead: u64) {}

        fn update_leadership(&self, _new_leader: bool) {}

        fn update_committed_index(&self, _committed_index: u64) {}

        fn is_id_removed(&self, id: u64) -> bool {
            id == 9
        }
    }

    fn new_node(transport: Arc<dyn Transport>) -> (Arc<NodeRecorder>, RaftNode) {
        let node = Arc::new(NodeRecorder::new());
        let rn = RaftNode::new(RaftNodeConfig {
            node: node.clone(),
            heartbeat: Duration::ZERO,
            raft_storage: Arc::new(MemRaftLog::new()),
            storage: Arc::new(StorageRecorder::new()),
            transport,
        });
        (node, rn)
    }

    /// Messages to removed members are zeroed out and never reach a peer.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_skips_removed_members() -> anyhow::Result<()> {
        let (transport, mut sent_rx) = CountingTransport::new();
        let (node, rn) = new_node(Arc::new(transport));
        let (_applyc, _msg_snap_rx) = rn.start(Arc::new(RemovedNineHandler));

        node.push_ready(Ready {
            messages: vec![
                Message::new(MessageKind::Heartbeat, 2, 1),
                Message::new(MessageKind::Heartbeat, 9, 1),
            ],
            ..Ready::default()
        })
        .await;

        let sent = tokio::time::timeout(Duration::from_secs(5), sent_rx.recv()).await?.unwrap();
        assert_eq!(1, sent);

        rn.stop().await;
        Ok(())
    }

    /// Snapshot messages are routed to the server loop for merging instead
    /// of being sent directly.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_snapshot_messages_routed_to_server() -> anyhow::Result<()> {
        let (transport, mut sent_rx) = CountingTransport::new();
        let (node, rn) = new_node(Arc::new(transport));
        let (_applyc, mut msg_snap_rx) = rn.start(Arc::new(RemovedNineHandler));

        node.push_ready(Ready {
            messages: vec![Message::new(MessageKind::Snapshot, 3, 1)],
            ..Ready::default()
        })
        .await;

        let routed = tokio::time::timeout(Duration::from_secs(5), msg_snap_rx.recv()).await?.unwrap();
        assert_eq!(3, routed.to);
        assert_eq!(MessageKind::Snapshot, routed.kind);

        // The direct send saw only the zeroed-out message.
        let sent = tokio::time::timeout(Duration::from_secs(5), sent_rx.recv()).await?.unwrap();
        assert_eq!(0, sent);

        rn.stop().await;
        Ok(())
    }
}
