//! Messages and cursors survive a broker restart on a filesystem store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bundlemq::client::{Publisher, SubscribeOptions, Subscriber};
use bundlemq::cluster::{open_log_store, Broker, MemoryCoordinator, PersistenceConfig};
use bundlemq::transport::local::LocalNetwork;
use bundlemq::types::{PublishMode, SubscribeMode};

use common::{broker_config, client_config, msids, receive_n};

#[tokio::test]
async fn test_restart_resumes_from_stored_state() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = PersistenceConfig::Local {
        path: dir.path().to_string_lossy().to_string(),
    };
    let coordinator = MemoryCoordinator::new();
    let network = LocalNetwork::new();

    let mut config = broker_config(0);
    config.persistence = persistence.clone();

    let broker = Broker::start(
        config.clone(),
        Arc::new(coordinator.new_session()),
        open_log_store(&persistence).unwrap(),
    )
    .await
    .unwrap();
    network.register(Arc::clone(&broker));
    let client = bundlemq::client::Client::new(client_config(broker.url()), Arc::new(network.clone()));

    let publisher = Publisher::connect(&client, "t", 1, "p", PublishMode::Shared)
        .await
        .unwrap();
    for i in 1..=4 {
        publisher.publish(format!("m{i}")).await.unwrap();
    }
    let mut sub = Subscriber::subscribe(
        &client,
        "t",
        Some(1),
        SubscribeOptions::new("audit", SubscribeMode::Shared).sub_offset(1),
    )
    .await
    .unwrap();
    assert_eq!(msids(&receive_n(&mut sub, 4, Duration::from_secs(2)).await), vec![1, 2, 3, 4]);
    drop(sub);
    drop(publisher);
    drop(client);

    broker.shutdown().await.unwrap();
    network.deregister(broker.url());
    drop(broker);

    let restarted = Broker::start(
        config,
        Arc::new(coordinator.new_session()),
        open_log_store(&persistence).unwrap(),
    )
    .await
    .unwrap();
    network.register(Arc::clone(&restarted));
    let client = bundlemq::client::Client::new(client_config(restarted.url()), Arc::new(network.clone()));

    let publisher = Publisher::connect(&client, "t", 1, "p", PublishMode::Shared)
        .await
        .unwrap();
    assert_eq!(publisher.publish("m5").await.unwrap(), 5);

    let snapshot = restarted.partition_snapshot("t", 1).await.unwrap();
    assert_eq!(snapshot.message_count, 5);
    assert_eq!(snapshot.push_offset, 4);

    // A replaying subscription reads the old bodies back from disk.
    let mut replay = Subscriber::subscribe(
        &client,
        "t",
        Some(1),
        SubscribeOptions::new("replay", SubscribeMode::Shared).sub_offset(2),
    )
    .await
    .unwrap();
    let messages = receive_n(&mut replay, 4, Duration::from_secs(2)).await;
    assert_eq!(msids(&messages), vec![2, 3, 4, 5]);
    assert_eq!(messages[0].payload, "m2");

    replay.unsubscribe().await.unwrap();
    restarted.shutdown().await.unwrap();
}
