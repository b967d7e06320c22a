//! Test doubles: action recorders and nop implementations of the external
//! seams (consensus, transport, persistent storage, wait registry).
//!
//! Recorders capture named actions; tests assert on the sequence. The
//! stream-flavoured recorders rendezvous on every action so a test can hold
//! the recorded side mid-sequence and observe ordering invariants.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::apply::ApplyResult;
use crate::apply::InternalRequest;
use crate::apply::RequestApplier;
use crate::apply::ServerResponse;
use crate::errors::StorageError;
use crate::membership::LegacyStore;
use crate::membership::ShouldApply;
use crate::notify::Closer;
use crate::raft::ConfChange;
use crate::raft::ConfChangeKind;
use crate::raft::ConfState;
use crate::raft::Consensus;
use crate::raft::ConsensusError;
use crate::raft::Entry;
use crate::raft::EntryKind;
use crate::raft::HardState;
use crate::raft::Message;
use crate::raft::Ready;
use crate::raft::Snapshot;
use crate::snap::Snapshotter;
use crate::storage::PersistentStorage;
use crate::transport::SnapMessage;
use crate::transport::Transport;
use crate::wait::Wait;

/// A recorded action: a name plus stringified parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub name: String,
    pub params: Vec<String>,
}

impl Action {
    pub fn named(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
        }
    }

    pub fn with_params(name: impl ToString, params: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            params,
        }
    }
}

/// Buffered action recorder.
#[derive(Debug, Default)]
pub struct Recorder {
    actions: Mutex<Vec<Action>>,
    notify: Notify,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, action: Action) {
        self.actions.lock().unwrap().push(action);
        self.notify.notify_waiters();
    }

    /// Snapshot of everything recorded so far.
    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }

    /// Wait until at least `n` actions were recorded and return them all.
    pub async fn wait(&self, n: usize) -> Vec<Action> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent record cannot slip
            // between the check and the await.
            notified.as_mut().enable();
            {
                let actions = self.actions.lock().unwrap();
                if actions.len() >= n {
                    return actions.clone();
                }
            }
            notified.await;
        }
    }
}

struct NodeCore {
    rec: Arc<Recorder>,
    ready_tx: mpsc::Sender<Ready>,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<Ready>>,
    stopped: Closer,
}

impl NodeCore {
    fn new() -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(1);
        Self {
            rec: Arc::new(Recorder::new()),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            stopped: Closer::new(),
        }
    }

    async fn next_ready(&self) -> Option<Ready> {
        let mut rx = self.ready_rx.lock().await;
        tokio::select! {
            rd = rx.recv() => rd,
            _ = self.stopped.closed() => None,
        }
    }
}

/// A consensus double that records every call. `ready()` yields only what
/// the test pushes with [`push_ready`](Self::push_ready) and pends forever
/// otherwise.
pub struct NodeRecorder {
    core: NodeCore,
    conf_state: Mutex<ConfState>,
}

impl NodeRecorder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            core: NodeCore::new(),
            conf_state: Mutex::new(ConfState::default()),
        }
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        self.core.rec.clone()
    }

    pub async fn push_ready(&self, rd: Ready) {
        self.core.ready_tx.send(rd).await.expect("ready consumer alive");
    }

    /// Fix the configuration returned by `apply_conf_change`.
    pub fn set_conf_state(&self, cs: ConfState) {
        *self.conf_state.lock().unwrap() = cs;
    }
}

#[async_trait]
impl Consensus for NodeRecorder {
    async fn ready(&self) -> Option<Ready> {
        self.core.next_ready().await
    }

    fn advance(&self) {}

    fn tick(&self) {
        self.core.rec.record(Action::named("Tick"));
    }

    async fn propose(&self, data: Vec<u8>) -> Result<(), ConsensusError> {
        self.core.rec.record(Action::with_params(
            "Propose",
            vec![String::from_utf8_lossy(&data).to_string()],
        ));
        Ok(())
    }

    async fn propose_conf_change(&self, _cc: ConfChange) -> Result<(), ConsensusError> {
        self.core.rec.record(Action::named("ProposeConfChange"));
        Ok(())
    }

    async fn step(&self, _msg: Message) -> Result<(), ConsensusError> {
        self.core.rec.record(Action::named("Step"));
        Ok(())
    }

    fn apply_conf_change(&self, cc: &ConfChange) -> ConfState {
        self.core.rec.record(Action::with_params("ApplyConfChange", vec![format!("{cc:?}")]));
        self.conf_state.lock().unwrap().clone()
    }

    fn stop(&self) {
        self.core.rec.record(Action::named("Stop"));
        self.core.stopped.close();
    }
}

fn conf_change_action_name(kind: ConfChangeKind) -> &'static str {
    match kind {
        ConfChangeKind::AddNode => "AddNode",
        ConfChangeKind::AddLearnerNode => "AddLearnerNode",
        ConfChangeKind::RemoveNode => "RemoveNode",
        ConfChangeKind::UpdateNode => "UpdateNode",
        ConfChangeKind::PromoteNode => "PromoteNode",
    }
}

/// A consensus double that commits every proposed conf change right back as
/// a committed entry, so membership proposals complete without a cluster.
pub struct ConfChangeCommitterNode {
    core: NodeCore,
    index: AtomicU64,
}

impl ConfChangeCommitterNode {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            core: NodeCore::new(),
            index: AtomicU64::new(0),
        }
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        self.core.rec.clone()
    }

    pub async fn push_ready(&self, rd: Ready) {
        self.core.ready_tx.send(rd).await.expect("ready consumer alive");
    }
}

#[async_trait]
impl Consensus for ConfChangeCommitterNode {
    async fn ready(&self) -> Option<Ready> {
        self.core.next_ready().await
    }

    fn advance(&self) {}

    fn tick(&self) {
        self.core.rec.record(Action::named("Tick"));
    }

    async fn propose(&self, data: Vec<u8>) -> Result<(), ConsensusError> {
        self.core.rec.record(Action::with_params(
            "Propose",
            vec![String::from_utf8_lossy(&data).to_string()],
        ));
        Ok(())
    }

    async fn propose_conf_change(&self, cc: ConfChange) -> Result<(), ConsensusError> {
        let index = self.index.fetch_add(1, Ordering::AcqRel) + 1;
        self.core.rec.record(Action::named(format!(
            "ProposeConfChange:{}",
            conf_change_action_name(cc.kind)
        )));

        let entry = Entry {
            term: 1,
            index,
            kind: EntryKind::ConfChange,
            data: serde_json::to_vec(&cc).expect("conf change serializes"),
        };
        self.core
            .ready_tx
            .send(Ready {
                committed_entries: vec![entry],
                ..Ready::default()
            })
            .await
            .expect("ready consumer alive");
        Ok(())
    }

    async fn step(&self, _msg: Message) -> Result<(), ConsensusError> {
        self.core.rec.record(Action::named("Step"));
        Ok(())
    }

    fn apply_conf_change(&self, cc: &ConfChange) -> ConfState {
        self.core.rec.record(Action::named(format!(
            "ApplyConfChange:{}",
            conf_change_action_name(cc.kind)
        )));
        ConfState::default()
    }

    fn stop(&self) {
        self.core.rec.record(Action::named("Stop"));
        self.core.stopped.close();
    }
}

/// Persistent-storage double. The stream flavour rendezvouses on every
/// action: the recording side blocks until the test receives it.
pub struct StorageRecorder {
    rec: Arc<Recorder>,
    stream: Option<std::sync::mpsc::SyncSender<Action>>,
}

impl StorageRecorder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            rec: Arc::new(Recorder::new()),
            stream: None,
        }
    }

    pub fn new_stream() -> (Self, std::sync::mpsc::Receiver<Action>) {
        let (tx, rx) = std::sync::mpsc::sync_channel(0);
        (
            Self {
                rec: Arc::new(Recorder::new()),
                stream: Some(tx),
            },
            rx,
        )
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        self.rec.clone()
    }

    fn record(&self, action: Action) {
        self.rec.record(action.clone());
        if let Some(stream) = &self.stream {
            let _ = stream.send(action);
        }
    }
}

impl PersistentStorage for StorageRecorder {
    fn save(&self, _hard_state: Option<&HardState>, _entries: &[Entry]) -> Result<(), StorageError> {
        self.record(Action::named("Save"));
        Ok(())
    }

    fn save_snap(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.record(Action::with_params("SaveSnap", vec![snapshot.metadata.index.to_string()]));
        Ok(())
    }

    fn sync(&self) -> Result<(), StorageError> {
        self.record(Action::named("Sync"));
        Ok(())
    }

    fn release(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.record(Action::with_params("Release", vec![snapshot.metadata.index.to_string()]));
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Transport that drops everything.
pub struct NopTransport;

impl Transport for NopTransport {
    fn send(&self, _msgs: Vec<Message>) {}

    fn send_snapshot(&self, _m: SnapMessage) {}
}

/// Transport that stages snapshot DB images like a real receiver and then
/// surfaces the message to the test.
pub struct SnapTransport {
    snapshotter: Snapshotter,
    tx: mpsc::Sender<SnapMessage>,
}

impl SnapTransport {
    pub fn new(snapshotter: Snapshotter) -> (Self, mpsc::Receiver<SnapMessage>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { snapshotter, tx }, rx)
    }
}

impl Transport for SnapTransport {
    fn send(&self, _msgs: Vec<Message>) {}

    fn send_snapshot(&self, m: SnapMessage) {
        self.snapshotter
            .save_db_from(&m.db, m.snapshot().metadata.index + 1)
            .expect("stage snapshot db");
        self.tx.try_send(m).expect("snapshot consumer alive");
    }
}

/// Transport that counts messages with a real recipient per send call.
pub struct CountingTransport {
    tx: mpsc::UnboundedSender<usize>,
}

impl CountingTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<usize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for CountingTransport {
    fn send(&self, msgs: Vec<Message>) {
        let sent = msgs.iter().filter(|m| m.to != 0).count();
        let _ = self.tx.send(sent);
    }

    fn send_snapshot(&self, _m: SnapMessage) {}
}

/// Wait registry whose registrations never resolve.
pub struct NopWait {
    keep_alive: Mutex<Vec<tokio::sync::oneshot::Sender<ServerResponse>>>,
}

impl NopWait {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            keep_alive: Mutex::new(Vec::new()),
        }
    }
}

impl Wait<ServerResponse> for NopWait {
    fn register(&self, _id: u64) -> tokio::sync::oneshot::Receiver<ServerResponse> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.keep_alive.lock().unwrap().push(tx);
        rx
    }

    fn trigger(&self, _id: u64, _value: ServerResponse) -> bool {
        false
    }

    fn is_registered(&self, _id: u64) -> bool {
        false
    }
}

/// Wait registry that answers every registration immediately with a queued
/// response, simulating a request that already went through consensus.
pub struct RespondingWait {
    responses: Mutex<Vec<ServerResponse>>,
}

impl RespondingWait {
    pub fn with_response(resp: ServerResponse) -> Self {
        Self {
            responses: Mutex::new(vec![resp]),
        }
    }
}

impl Wait<ServerResponse> for RespondingWait {
    fn register(&self, _id: u64) -> tokio::sync::oneshot::Receiver<ServerResponse> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if let Some(resp) = self.responses.lock().unwrap().pop() {
            let _ = tx.send(resp);
        }
        rx
    }

    fn trigger(&self, _id: u64, _value: ServerResponse) -> bool {
        false
    }

    fn is_registered(&self, _id: u64) -> bool {
        true
    }
}

/// Applier double that acknowledges every request with an empty result.
pub struct NopApplier;

impl RequestApplier for NopApplier {
    fn apply(&self, _req: &InternalRequest, _should_apply: ShouldApply) -> ApplyResult {
        ApplyResult::default()
    }
}

/// Legacy-store double recording every mirror write.
pub struct StoreRecorder {
    rec: Arc<Recorder>,
}

impl StoreRecorder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            rec: Arc::new(Recorder::new()),
        }
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        self.rec.clone()
    }
}

impl LegacyStore for StoreRecorder {
    fn create(&self, path: &str, _value: &str) {
        self.rec.record(Action::with_params("Create", vec![path.to_string()]));
    }

    fn set(&self, path: &str, _value: &str) {
        self.rec.record(Action::with_params("Set", vec![path.to_string()]));
    }

    fn delete(&self, path: &str) {
        self.rec.record(Action::with_params("Delete", vec![path.to_string()]));
    }
}
