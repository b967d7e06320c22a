use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::membership::HierStore;
use crate::membership::RaftCluster;
use crate::raft::Consensus;
use crate::raft::MemRaftLog;
use crate::raft::RaftNode;
use crate::raft::RaftNodeConfig;
use crate::server::Server;
use crate::snap::Snapshotter;
use crate::storage::schema::MembershipBackend;
use crate::storage::Backend;
use crate::storage::PersistentStorage;
use crate::testing::NopTransport;
use crate::testing::StorageRecorder;
use crate::transport::Transport;
use crate::types::MemberId;

/// Route test logs through the captured test writer; repeated calls are
/// no-ops.
pub(crate) fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub(crate) fn test_config(data_dir: &std::path::Path) -> ServerConfig {
    ServerConfig {
        data_dir: data_dir.to_path_buf(),
        ..ServerConfig::default()
    }
}

/// A raft node with ticking disabled; tests drive the consensus double
/// directly.
pub(crate) fn new_raft_node(
    node: Arc<dyn Consensus>,
    storage: Arc<dyn PersistentStorage>,
    transport: Arc<dyn Transport>,
) -> RaftNode {
    RaftNode::new(RaftNodeConfig {
        node,
        heartbeat: Duration::ZERO,
        raft_storage: Arc::new(MemRaftLog::new()),
        storage,
        transport,
    })
}

/// A server over a fresh in-memory backend, a recording persistent storage
/// and a nop transport, with member id 1. Returned unwrapped so tests can
/// swap seams (wait registry, applier, cursor) before starting it.
pub(crate) fn new_test_server(node: Arc<dyn Consensus>) -> (Server, tempfile::TempDir) {
    new_test_server_with(node, Arc::new(StorageRecorder::new()), Arc::new(NopTransport))
}

pub(crate) fn new_test_server_with(
    node: Arc<dyn Consensus>,
    storage: Arc<dyn PersistentStorage>,
    transport: Arc<dyn Transport>,
) -> (Server, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = test_config(dir.path());
    std::fs::create_dir_all(cfg.snap_dir()).expect("snap dir");

    let be = Arc::new(Backend::new());
    let cluster = Arc::new(RaftCluster::new());
    cluster.set_backend(MembershipBackend::new(be.clone()));
    cluster.set_store(Arc::new(HierStore::new()));

    let snapshotter = Arc::new(Snapshotter::new(cfg.snap_dir()));
    let r = new_raft_node(node, storage, transport);

    let srv = Server::new(cfg, MemberId(1), r, cluster, be, snapshotter).expect("server config is valid");
    (srv, dir)
}
