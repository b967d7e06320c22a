use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::apply::ApplyResult;
use crate::apply::ClusterVersionSetRequest;
use crate::apply::InternalRequest;
use crate::apply::RequestOp;
use crate::apply::ServerResponse;
use crate::membership::Attributes;
use crate::server::test_util::new_test_server;
use crate::testing::NodeRecorder;
use crate::testing::NopWait;
use crate::testing::RespondingWait;
use crate::types::MemberId;

fn test_attributes() -> Attributes {
    Attributes {
        name: "node1".to_string(),
        client_urls: vec!["http://a".to_string(), "http://b".to_string()],
    }
}

/// Publishing proposes exactly one attribute-set request once the cluster
/// confirms it.
#[tokio::test]
async fn test_publish_attributes() -> anyhow::Result<()> {
    let node = Arc::new(NodeRecorder::new());
    let rec = node.recorder();

    let (mut srv, _dir) = new_test_server(node);
    srv.attributes = test_attributes();
    // Simulate a request that already went through consensus.
    srv.w = Arc::new(RespondingWait::with_response(ServerResponse::Applied(ApplyResult::default())));
    let srv = Arc::new(srv);

    srv.publish_attributes(Duration::from_secs(3600)).await;

    let actions = rec.actions();
    assert_eq!(1, actions.len());
    assert_eq!("Propose", actions[0].name);

    let proposed: InternalRequest = serde_json::from_str(&actions[0].params[0])?;
    match proposed.op {
        RequestOp::ClusterMemberAttrSet(r) => {
            assert_eq!(MemberId(1), r.member_id);
            assert_eq!(test_attributes(), r.attributes);
        }
        other => panic!("unexpected proposal {other:?}"),
    }
    assert!(srv.ready_notify().is_closed());
    Ok(())
}

/// Publishing gives up promptly when the server is already stopping.
#[tokio::test]
async fn test_publish_stopped() {
    let node = Arc::new(NodeRecorder::new());
    let (mut srv, _dir) = new_test_server(node);
    srv.w = Arc::new(NopWait::new());
    let srv = Arc::new(srv);

    srv.stopping.close();
    tokio::time::timeout(Duration::from_secs(5), srv.publish_attributes(Duration::from_secs(3600)))
        .await
        .expect("publish returns once stopping");
    assert!(!srv.ready_notify().is_closed());
}

/// Publishing keeps retrying with fresh request ids until it is stopped.
#[tokio::test(flavor = "multi_thread")]
async fn test_publish_retry() -> anyhow::Result<()> {
    let node = Arc::new(NodeRecorder::new());
    let rec = node.recorder();

    let (mut srv, _dir) = new_test_server(node);
    srv.attributes = test_attributes();
    // Registrations never resolve: no acknowledgement ever arrives.
    srv.w = Arc::new(NopWait::new());
    let srv = Arc::new(srv);

    let publisher = {
        let srv = srv.clone();
        tokio::spawn(async move {
            srv.publish_attributes(Duration::from_nanos(10)).await;
        })
    };

    let actions = tokio::time::timeout(Duration::from_secs(5), rec.wait(2)).await?;
    let proposals: Vec<_> = actions.iter().filter(|a| a.name == "Propose").collect();
    assert!(proposals.len() >= 2, "expected at least two proposal attempts");

    // Retries carry distinct request ids.
    let first: InternalRequest = serde_json::from_str(&proposals[0].params[0])?;
    let second: InternalRequest = serde_json::from_str(&proposals[1].params[0])?;
    assert_ne!(first.header.id, second.header.id);

    srv.stopping.close();
    tokio::time::timeout(Duration::from_secs(5), publisher).await??;
    Ok(())
}

#[tokio::test]
async fn test_update_cluster_version() -> anyhow::Result<()> {
    let node = Arc::new(NodeRecorder::new());
    let rec = node.recorder();

    let (mut srv, _dir) = new_test_server(node);
    srv.w = Arc::new(RespondingWait::with_response(ServerResponse::Applied(ApplyResult::default())));
    let srv = Arc::new(srv);

    srv.update_cluster_version("2.0.0".to_string()).await;

    let actions = rec.actions();
    assert_eq!(1, actions.len());
    assert_eq!("Propose", actions[0].name);

    let proposed: InternalRequest = serde_json::from_str(&actions[0].params[0])?;
    assert_eq!(
        RequestOp::ClusterVersionSet(ClusterVersionSetRequest { ver: "2.0.0".to_string() }),
        proposed.op
    );
    Ok(())
}
