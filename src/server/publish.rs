//! Publishers: member attributes and the agreed cluster version.

use std::sync::Arc;
use std::time::Duration;

use crate::apply::ClusterVersionSetRequest;
use crate::apply::InternalRequest;
use crate::apply::MemberAttrSetRequest;
use crate::apply::RequestOp;
use crate::errors::ServerError;
use crate::server::Server;
use crate::version;

/// How often the version monitor re-evaluates without a leadership event.
const MONITOR_VERSION_INTERVAL: Duration = Duration::from_secs(5);

impl Server {
    /// Publish this member's attributes to the cluster.
    ///
    /// Retries with a fresh request id and `timeout` per attempt
    /// until the cluster confirms the entry by applying it, then marks the
    /// server ready. Exits early once the server starts stopping.
    #[tracing::instrument(level = "info", skip_all, fields(member = %self.member_id))]
    pub(crate) async fn publish_attributes(self: &Arc<Self>, timeout: Duration) {
        loop {
            if self.stopping.is_closed() {
                tracing::warn!(
                    name = %self.attributes.name,
                    "stopped publish because server is stopping"
                );
                return;
            }

            let req = InternalRequest::new(
                self.req_id_gen.next(),
                RequestOp::ClusterMemberAttrSet(MemberAttrSetRequest {
                    member_id: self.member_id,
                    attributes: self.attributes.clone(),
                }),
            );

            let attempt = tokio::time::timeout(timeout, self.raft_request_once(&req));
            match attempt.await {
                Ok(Ok(_)) => {
                    self.readych.close();
                    tracing::info!(
                        name = %self.attributes.name,
                        client_urls = ?self.attributes.client_urls,
                        "published local member attributes to cluster"
                    );
                    return;
                }
                Ok(Err(ServerError::Stopped)) => {
                    tracing::warn!("stopped publish because server is stopping");
                    return;
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "failed to publish local member attributes, retrying");
                }
                Err(_elapsed) => {
                    tracing::warn!("publish attempt timed out, retrying");
                }
            }
        }
    }

    /// Keep the agreed cluster version up to date while this member leads.
    ///
    /// Wakes on leadership changes (and periodically as a fallback); when
    /// leading a cluster with no agreed version yet, proposes this binary's
    /// cluster version.
    pub(crate) async fn monitor_cluster_versions(self: &Arc<Self>) {
        let mut leadership = self.state.first_commit_in_term.subscribe();
        loop {
            tokio::select! {
                _ = leadership.changed() => {}
                _ = tokio::time::sleep(MONITOR_VERSION_INTERVAL) => {}
                _ = self.stopping.closed() => return,
            }

            if self.leader() != self.member_id {
                continue;
            }
            if self.cluster.version().is_some() {
                continue;
            }
            self.update_cluster_version(version::cluster_version().to_string()).await;
        }
    }

    /// Propose a new agreed cluster version.
    pub(crate) async fn update_cluster_version(self: &Arc<Self>, ver: String) {
        tracing::info!(
            from = %self.cluster.version().map(|v| v.to_string()).unwrap_or_else(|| "unset".to_string()),
            to = %ver,
            "updating cluster version"
        );

        let req = InternalRequest::new(
            self.req_id_gen.next(),
            RequestOp::ClusterVersionSet(ClusterVersionSetRequest { ver }),
        );
        let attempt = tokio::time::timeout(self.cfg.publish_timeout(), self.raft_request_once(&req));
        match attempt.await {
            Ok(Ok(_)) => tracing::info!("cluster version updated"),
            Ok(Err(ServerError::Stopped)) => tracing::info!("aborting cluster version update; server is stopping"),
            Ok(Err(err)) => tracing::error!(error = %err, "failed to update cluster version"),
            Err(_elapsed) => tracing::error!("cluster version update timed out"),
        }
    }
}
