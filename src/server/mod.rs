//! The server core: lifecycle, the run loop, and client-facing entry points.
//!
//! [`Server`] owns the raft node wrapper and the apply pipeline. `start`
//! spawns the run loop, which is the sole consumer of the apply channel and
//! the sole writer of the applied index, the consistent index, and the
//! membership view. Stopping is a three-stage handshake: `stop` is the
//! external request, `stopping` tells workers to wind down, `done` closes
//! when everything has exited.

mod apply;
mod proposals;
mod publish;
mod snapshot;

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::alarm::AlarmStore;
use crate::apply::RequestApplier;
use crate::apply::ServerResponse;
use crate::apply::UberApplier;
use crate::auth::AuthStore;
use crate::capability::CapabilityTable;
use crate::cindex::ConsistentIndex;
use crate::cindex::ConsistentIndexer;
use crate::config::ConfigError;
use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::features::FeatureGate;
use crate::id_gen::IdGenerator;
use crate::lease::Lessor;
use crate::membership::Attributes;
use crate::membership::RaftCluster;
use crate::mvcc::KvStore;
use crate::notify::Closer;
use crate::notify::Notifier;
use crate::raft::ConfState;
use crate::raft::Message;
use crate::raft::RaftNode;
use crate::raft::ReadyHandler;
use crate::raft::ToApply;
use crate::snap::Snapshotter;
use crate::storage::Backend;
use crate::storage::BackendHooks;
use crate::types::MemberId;
use crate::wait::Wait;
use crate::wait::WaitList;
use crate::wait::WaitTime;

/// Apply progress, owned by the run loop.
#[derive(Debug, Clone, Default)]
pub(crate) struct Progress {
    pub conf_state: ConfState,
    pub applied_term: u64,
    pub applied_index: u64,
    pub memory_snapshot_index: u64,
    pub disk_snapshot_index: u64,
}

/// Shared mutable server state: the capability handed to the raft node
/// wrapper, and the atomics client tasks read.
pub(crate) struct ServerState {
    pub(crate) applied_index: AtomicU64,
    pub(crate) applied_term: AtomicU64,
    pub(crate) committed_index: AtomicU64,
    pub(crate) lead: AtomicU64,
    pub(crate) cluster: Arc<RaftCluster>,
    pub(crate) first_commit_in_term: Notifier,
}

impl ServerState {
    pub(crate) fn new(cluster: Arc<RaftCluster>) -> Self {
        Self {
            applied_index: AtomicU64::new(0),
            applied_term: AtomicU64::new(0),
            committed_index: AtomicU64::new(0),
            lead: AtomicU64::new(0),
            cluster,
            first_commit_in_term: Notifier::new(),
        }
    }

    pub(crate) fn set_applied(&self, term: u64, index: u64) {
        self.applied_term.store(term, Ordering::Release);
        self.applied_index.store(index, Ordering::Release);
    }
}

impl ReadyHandler for ServerState {
    fn update_lead(&self, lead: u64) {
        self.lead.store(lead, Ordering::Release);
    }

    fn update_leadership(&self, new_leader: bool) {
        if new_leader {
            self.first_commit_in_term.notify();
        }
    }

    fn update_committed_index(&self, committed_index: u64) {
        // Monotone; a stale Ready must not move it backwards.
        self.committed_index.fetch_max(committed_index, Ordering::AcqRel);
    }

    fn is_id_removed(&self, id: u64) -> bool {
        self.cluster.is_id_removed(MemberId(id))
    }
}

/// The replicated key-value server core.
pub struct Server {
    pub(crate) cfg: ServerConfig,
    pub(crate) member_id: MemberId,
    pub(crate) r: RaftNode,
    pub(crate) cluster: Arc<RaftCluster>,
    pub(crate) be: Arc<Backend>,
    pub(crate) kv: Arc<KvStore>,
    pub(crate) lessor: Arc<Lessor>,
    pub(crate) auth_store: Arc<AuthStore>,
    pub(crate) alarm_store: Arc<AlarmStore>,
    pub(crate) snapshotter: Arc<Snapshotter>,
    pub(crate) consist_index: Arc<dyn ConsistentIndexer>,
    pub(crate) be_hooks: Arc<BackendHooks>,
    pub(crate) uber_apply: Arc<dyn RequestApplier>,
    pub(crate) w: Arc<dyn Wait<ServerResponse>>,
    pub(crate) apply_wait: Arc<WaitTime>,
    pub(crate) req_id_gen: Arc<IdGenerator>,
    pub(crate) attributes: Attributes,
    pub(crate) feature_gate: Arc<FeatureGate>,
    pub(crate) state: Arc<ServerState>,

    /// Closed once this member has published its attributes.
    pub(crate) readych: Closer,
    pub(crate) stop: Closer,
    pub(crate) stopping: Closer,
    pub(crate) done: Closer,
}

impl Server {
    /// Assemble a server over the given backend, cluster and raft node. The
    /// apply pipeline (consistent index, hooks, KV/lease/auth/alarm stores,
    /// applier, wait registry) is built here.
    pub fn new(
        cfg: ServerConfig,
        member_id: MemberId,
        r: RaftNode,
        cluster: Arc<RaftCluster>,
        be: Arc<Backend>,
        snapshotter: Arc<Snapshotter>,
    ) -> Result<Server, ConfigError> {
        let feature_gate = Arc::new(cfg.server_feature_gate()?);

        let consist_index: Arc<dyn ConsistentIndexer> = Arc::new(ConsistentIndex::new(be.clone()));
        let be_hooks = Arc::new(BackendHooks::new(Some(consist_index.clone())));
        be.set_hooks(be_hooks.clone());

        let kv = Arc::new(KvStore::new(be.clone()));
        let lessor = Arc::new(Lessor::new(be.clone()));
        let auth_store = Arc::new(AuthStore::new(be.clone()));
        let alarm_store = Arc::new(AlarmStore::new(be.clone()));
        let caps = Arc::new(CapabilityTable::new());

        let uber_apply = Arc::new(UberApplier::new(
            be.clone(),
            kv.clone(),
            lessor.clone(),
            auth_store.clone(),
            alarm_store.clone(),
            cluster.clone(),
            caps,
            feature_gate.clone(),
            cfg.quota_backend_bytes,
        ));

        let attributes = Attributes {
            name: cfg.name.clone(),
            client_urls: cfg.client_urls.clone(),
        };
        let req_id_gen = Arc::new(IdGenerator::new(member_id.get() as u16));
        let state = Arc::new(ServerState::new(cluster.clone()));

        Ok(Server {
            cfg,
            member_id,
            r,
            cluster,
            be,
            kv,
            lessor,
            auth_store,
            alarm_store,
            snapshotter,
            consist_index,
            be_hooks,
            uber_apply,
            w: Arc::new(WaitList::new()),
            apply_wait: Arc::new(WaitTime::new()),
            req_id_gen,
            attributes,
            feature_gate,
            state,
            readych: Closer::new(),
            stop: Closer::new(),
            stopping: Closer::new(),
            done: Closer::new(),
        })
    }

    /// Start the server: the run loop plus the publisher tasks.
    pub fn start(self: &Arc<Self>) {
        self.start_core();

        let srv = self.clone();
        tokio::spawn(async move {
            let timeout = srv.cfg.publish_timeout();
            srv.publish_attributes(timeout).await;
        });
        let srv = self.clone();
        tokio::spawn(async move {
            srv.monitor_cluster_versions().await;
        });
    }

    /// Start only the run loop. Publishing is separate so the apply pipeline
    /// can be driven in isolation.
    pub(crate) fn start_core(self: &Arc<Self>) {
        self.feature_gate.close();

        // Resume where the persisted cursor left off; everything below it
        // is deduplicated on replay.
        let index = self.consist_index.consistent_index();
        let term = self.consist_index.consistent_term();
        self.state.set_applied(term, index);

        let (applyc, msg_snap_rx) = self.r.start(self.state.clone());

        let srv = self.clone();
        tokio::spawn(
            async move {
                srv.run(applyc, msg_snap_rx).await;
            }
            .instrument(tracing::info_span!("server_run", member = %self.member_id)),
        );
    }

    async fn run(self: Arc<Self>, mut applyc: mpsc::Receiver<ToApply>, mut msg_snap_rx: mpsc::Receiver<Message>) {
        let applied_index = self.applied_index();
        let mut ep = Progress {
            conf_state: ConfState::default(),
            applied_term: self.state.applied_term.load(Ordering::Acquire),
            applied_index,
            memory_snapshot_index: applied_index,
            disk_snapshot_index: applied_index,
        };

        let mut msg_snap_open = true;
        loop {
            tokio::select! {
                maybe_ap = applyc.recv() => {
                    let Some(ap) = maybe_ap else { break };
                    self.apply_all(&mut ep, ap).await;
                }
                maybe_msg = msg_snap_rx.recv(), if msg_snap_open => {
                    match maybe_msg {
                        Some(m) => self.send_merged_snapshot(m, &ep),
                        None => msg_snap_open = false,
                    }
                }
                _ = self.stop.closed() => break,
            }
        }

        tracing::info!(member = %self.member_id, "server run loop winding down");
        self.stopping.close();

        // Drop the channels first: a batch still buffered towards the apply
        // loop would otherwise leave the pump blocked on its persistence
        // handshake and the stop would never finish.
        drop(applyc);
        drop(msg_snap_rx);

        self.r.stop().await;
        self.done.close();
    }

    async fn apply_all(self: &Arc<Self>, ep: &mut Progress, mut ap: ToApply) {
        self.apply_snapshot(ep, &mut ap).await;
        let should_stop = self.apply_entries(ep, &mut ap).await;
        self.apply_wait.trigger(ep.applied_index);

        // Wait for the raft loop to finish persisting and fanning out this
        // batch before a snapshot may be cut at its index.
        let _ = ap.notifyc.recv().await;

        self.trigger_snapshot(ep);

        if should_stop {
            tracing::warn!(member = %self.member_id, "this member was removed from the cluster, stopping");
            self.stop.close();
        }
    }

    /// External close request. Resolves when the run loop has fully wound
    /// down.
    pub async fn stop(&self) {
        self.stop.close();
        self.done.closed().await;
    }

    /// The channel closed once the server has completely stopped.
    pub fn stop_notify(&self) -> Closer {
        self.done.clone()
    }

    /// A signal closed once this member has published its attributes.
    pub fn ready_notify(&self) -> Closer {
        self.readych.clone()
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn leader(&self) -> MemberId {
        MemberId(self.state.lead.load(Ordering::Acquire))
    }

    pub fn applied_index(&self) -> u64 {
        self.state.applied_index.load(Ordering::Acquire)
    }

    pub fn committed_index(&self) -> u64 {
        self.state.committed_index.load(Ordering::Acquire)
    }

    pub fn cluster(&self) -> &Arc<RaftCluster> {
        &self.cluster
    }

    /// Whether the raft loop has ticked recently. The threshold is three
    /// tick periods.
    pub fn is_active(&self) -> bool {
        self.r.latest_tick().elapsed() < Duration::from_millis(3 * self.cfg.tick_ms)
    }

    /// Block until the applied index catches up with the committed index
    /// observed at call time.
    pub async fn wait_applied_index(&self) -> Result<(), ServerError> {
        let rx = self.apply_wait.wait(self.committed_index());
        tokio::select! {
            res = rx => res.map_err(|_| ServerError::Stopped),
            _ = self.stopping.closed() => Err(ServerError::Stopped),
            _ = tokio::time::sleep(self.cfg.wait_applied_index_timeout()) => {
                Err(ServerError::TimeoutWaitAppliedIndex)
            }
        }
    }

    /// Feed a peer message into consensus. Messages for another member or
    /// from a removed member are rejected without touching raft.
    pub async fn process(&self, m: Message) -> Result<(), ServerError> {
        if self.cluster.is_id_removed(MemberId(m.from)) {
            tracing::warn!(from = m.from, "rejected message from removed member");
            return Err(ServerError::RejectFromRemovedMember);
        }
        if m.to != self.member_id.get() {
            return Err(ServerError::UnexpectedRecipient);
        }
        self.r.node().step(m).await.map_err(|_| ServerError::Stopped)
    }
}

#[cfg(test)]
mod apply_test;
#[cfg(test)]
mod publish_test;
#[cfg(test)]
mod snapshot_test;
#[cfg(test)]
mod test_util;
