//! Bundle lookup and allocation across a small cluster.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use bundlemq::cluster::{BundleTable, ClientSession};
use bundlemq::protocol::ConnectRequest;
use bundlemq::transport::ClientLink;
use bundlemq::types::{ClientRole, Delivery, PublishMode, ResourceUsage};
use bundlemq::{Error, Result};

use common::TestCluster;

struct NullLink;

#[async_trait]
impl ClientLink for NullLink {
    fn url(&self) -> &str {
        "client-null"
    }
    async fn deliver(&self, _delivery: Delivery) -> Result<()> {
        Ok(())
    }
    async fn alive_check(&self) -> Result<()> {
        Ok(())
    }
}

fn connect_request(topic: &str, partition: u32) -> ConnectRequest {
    ConnectRequest {
        client_id: "c1".into(),
        name: "pub".into(),
        url: "client-null".into(),
        topic: topic.into(),
        partition,
        partition_count: 4,
        role: ClientRole::Publisher,
        publish_mode: PublishMode::Shared,
        timeout_ms: 100,
    }
}

#[tokio::test]
async fn test_unowned_lookup_then_allocation_is_sticky() {
    let cluster = TestCluster::start(2).await;
    let leader_url = cluster.url(0);

    let err = cluster.broker(1).lookup("t", 1).await.unwrap_err();
    assert_eq!(err, Error::NeedAllocation { leader_url: leader_url.clone() });

    let owner = cluster.broker(0).request_alloc("t", 1).await.unwrap();
    assert!(owner == cluster.url(0) || owner == cluster.url(1));

    let table = BundleTable::even(cluster.broker(0).config().bundles.count).unwrap();
    let bundle = table.bundle_for("t", 1).id;
    let (before, version) = cluster
        .broker(0)
        .metadata()
        .get_bundle(bundle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.owner_url.as_deref(), Some(owner.as_str()));

    for broker in &cluster.brokers {
        assert_eq!(broker.lookup("t", 1).await.unwrap(), owner);
        assert_eq!(broker.lookup("t", 1).await.unwrap(), owner);
    }
    // A repeated allocation request returns the same owner.
    assert_eq!(cluster.broker(0).request_alloc("t", 1).await.unwrap(), owner);

    let (_, after) = cluster
        .broker(0)
        .metadata()
        .get_bundle(bundle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(version, after, "no further allocation writes");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_non_leader_redirects_allocation() {
    let cluster = TestCluster::start(2).await;
    assert!(cluster.broker(0).is_leader().await);
    assert!(!cluster.broker(1).is_leader().await);

    let err = cluster.broker(1).request_alloc("t", 2).await.unwrap_err();
    assert_eq!(err, Error::NeedAllocation { leader_url: cluster.url(0) });

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_allocation_prefers_least_loaded_broker() {
    let cluster = TestCluster::start(2).await;
    cluster
        .broker(0)
        .report_usage(ResourceUsage {
            cpu: 0.9,
            ..Default::default()
        })
        .await
        .unwrap();

    let owner = cluster.broker(0).request_alloc("orders", 3).await.unwrap();
    assert_eq!(owner, cluster.url(1));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_connect_on_non_owner_is_rejected() {
    let cluster = TestCluster::start(2).await;
    cluster
        .broker(0)
        .report_usage(ResourceUsage {
            memory: 0.5,
            ..Default::default()
        })
        .await
        .unwrap();
    let owner = cluster.broker(0).request_alloc("t", 1).await.unwrap();
    assert_eq!(owner, cluster.url(1));

    let session = ClientSession::new(Arc::new(NullLink));
    let err = cluster
        .broker(0)
        .connect(&session, connect_request("t", 1))
        .await
        .unwrap_err();
    assert_eq!(err, Error::AlreadyOwned(cluster.url(1)));

    let name = cluster
        .broker(1)
        .connect(&session, connect_request("t", 1))
        .await
        .unwrap();
    assert_eq!(name, "t:p1:publisher:pub");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_connect_before_allocation_needs_allocation() {
    let cluster = TestCluster::start(1).await;
    let session = ClientSession::new(Arc::new(NullLink));
    let err = cluster
        .broker(0)
        .connect(&session, connect_request("fresh", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NeedAllocation { .. }));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_client_locate_follows_redirect() {
    let cluster = TestCluster::start(2).await;
    // Bootstrap at the non-leader; the lookup redirect points at broker 0.
    let client = cluster.client_with(common::client_config(&cluster.url(1)));

    let owner = client.locate("t", 1).await.unwrap();
    assert_eq!(client.locate("t", 1).await.unwrap(), owner);
    assert_eq!(cluster.broker(1).lookup("t", 1).await.unwrap(), owner);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_topic_info_after_first_connect() {
    let cluster = TestCluster::start(1).await;
    let client = cluster.client();

    let err = client.topic_partitions("t").await.unwrap_err();
    assert!(err.is_not_found());

    let owner = client.locate("t", 1).await.unwrap();
    let session = ClientSession::new(Arc::new(NullLink));
    cluster
        .owner(&owner)
        .connect(&session, connect_request("t", 1))
        .await
        .unwrap();
    assert_eq!(client.topic_partitions("t").await.unwrap(), 4);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_invalid_topic_name_is_rejected() {
    let cluster = TestCluster::start(1).await;
    let err = cluster.broker(0).lookup("", 1).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    cluster.shutdown().await;
}
