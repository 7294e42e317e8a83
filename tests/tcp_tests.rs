//! End-to-end over real sockets.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bundlemq::client::{Client, Publisher, SubscribeOptions, Subscriber};
use bundlemq::cluster::{Broker, BrokerConfig, MemoryCoordinator, MemoryLogStore};
use bundlemq::server::RpcServer;
use bundlemq::transport::tcp::RpcClient;
use bundlemq::transport::{BrokerService, ClientLink};
use bundlemq::types::{Delivery, PublishMode, SubscribeMode};
use bundlemq::{Error, Result};
use tokio::task::JoinHandle;

use common::{msids, receive_n};

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

struct TcpBroker {
    broker: Arc<Broker>,
    server: Arc<RpcServer>,
    serve: JoinHandle<Result<()>>,
}

impl TcpBroker {
    async fn start() -> Self {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = BrokerConfig {
            port,
            ..common::broker_config(0)
        };
        let broker = Broker::start(
            config,
            Arc::new(MemoryCoordinator::new()),
            Arc::new(MemoryLogStore::new()),
        )
        .await
        .unwrap();
        let server = Arc::new(RpcServer::new(broker.url(), Arc::clone(&broker)).await.unwrap());
        let serving = Arc::clone(&server);
        let serve = tokio::spawn(async move { serving.run().await });
        Self { broker, server, serve }
    }

    fn url(&self) -> String {
        self.broker.url().to_string()
    }

    async fn stop(self) {
        self.server.shutdown_and_wait(Duration::from_secs(2)).await;
        self.serve.await.unwrap().unwrap();
        self.broker.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_publish_and_subscribe_over_tcp() {
    let node = TcpBroker::start().await;
    let client = Client::tcp(common::client_config(&node.url()));

    let publisher = Publisher::connect(&client, "t", 1, "producer", PublishMode::Shared)
        .await
        .unwrap();
    for i in 1..=3 {
        assert_eq!(publisher.publish(format!("m{i}")).await.unwrap(), i);
    }

    let mut sub = Subscriber::subscribe(
        &client,
        "t",
        Some(1),
        SubscribeOptions::new("audit", SubscribeMode::Shared),
    )
    .await
    .unwrap();
    let messages = receive_n(&mut sub, 3, Duration::from_secs(2)).await;
    assert_eq!(msids(&messages), vec![1, 2, 3]);
    assert_eq!(messages[1].payload, "m2");
    sub.ack(&messages[2]).await.unwrap();

    let record = node
        .broker
        .subscription("t", 1, "audit")
        .await
        .unwrap()
        .record()
        .await;
    assert_eq!(record.ack_offset, 3);
    assert_eq!(client.topic_partitions("t").await.unwrap(), 1);

    sub.unsubscribe().await.unwrap();
    publisher.close().await.unwrap();
    node.stop().await;
}

#[tokio::test]
async fn test_routing_errors_survive_the_wire() {
    let node = TcpBroker::start().await;
    let rpc = RpcClient::connect(&node.url(), Arc::new(NullLink)).await.unwrap();

    let err = rpc.lookup("t", 1).await.unwrap_err();
    assert_eq!(err, Error::NeedAllocation { leader_url: node.url() });

    let owner = rpc.request_alloc("t", 1).await.unwrap();
    assert_eq!(owner, node.url());
    assert_eq!(rpc.lookup("t", 1).await.unwrap(), owner);

    let err = rpc.get_topic_info("missing").await.unwrap_err();
    assert!(err.is_not_found());

    drop(rpc);
    node.stop().await;
}

#[tokio::test]
async fn test_exclusive_conflict_over_tcp() {
    let node = TcpBroker::start().await;
    let first = Client::tcp(common::client_config(&node.url()));
    let second = Client::tcp(common::client_config(&node.url()));

    let _holder = Subscriber::subscribe(
        &first,
        "t",
        Some(1),
        SubscribeOptions::new("excl", SubscribeMode::Exclusive).name("a"),
    )
    .await
    .unwrap();
    let err = Subscriber::subscribe(
        &second,
        "t",
        Some(1),
        SubscribeOptions::new("excl", SubscribeMode::Exclusive).name("b"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::AlreadyOwned(_)), "{err:?}");

    node.stop().await;
}

#[tokio::test]
async fn test_dial_refused_is_transport_error() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let err = RpcClient::connect(&format!("127.0.0.1:{port}"), Arc::new(NullLink))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err:?}");
}

#[tokio::test]
async fn test_server_shutdown_closes_client_connections() {
    let node = TcpBroker::start().await;
    let rpc = RpcClient::connect(&node.url(), Arc::new(NullLink)).await.unwrap();
    rpc.request_alloc("t", 1).await.unwrap();
    assert_eq!(node.server.active_connections(), 1);

    assert!(node.server.shutdown_and_wait(Duration::from_secs(2)).await);
    let closed = common::eventually(Duration::from_secs(1), || async { rpc.is_closed() }).await;
    assert!(closed);
    assert!(rpc.lookup("t", 1).await.is_err());
}
