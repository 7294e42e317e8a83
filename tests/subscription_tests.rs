//! Subscription modes end to end through the client library.

mod common;

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use bundlemq::client::{Client, Publisher, SubscribeOptions, Subscriber};
use bundlemq::types::{Msid, PublishMode, SubscribeMode};
use bundlemq::Error;

use common::{msids, receive_n, TestCluster};

const WAIT: Duration = Duration::from_secs(2);

async fn publisher(client: &Client, topic: &str) -> Publisher {
    Publisher::connect(client, topic, 1, "producer", PublishMode::Shared)
        .await
        .unwrap()
}

async fn subscribe(client: &Client, topic: &str, options: SubscribeOptions) -> bundlemq::Result<Subscriber> {
    Subscriber::subscribe(client, topic, Some(1), options).await
}

/// Drain `subscribers` until `total` messages arrived overall.
async fn collect(subscribers: &mut [Subscriber], total: usize) -> Vec<Vec<(Msid, Option<String>)>> {
    let mut seen = vec![Vec::new(); subscribers.len()];
    let deadline = tokio::time::Instant::now() + WAIT * 2;
    while seen.iter().map(Vec::len).sum::<usize>() < total {
        assert!(tokio::time::Instant::now() < deadline, "messages missing: {seen:?}");
        for (i, sub) in subscribers.iter_mut().enumerate() {
            if let Ok(message) = sub.receive_timeout(Duration::from_millis(20)).await {
                seen[i].push((message.msid, message.key.clone()));
            }
        }
    }
    seen
}

#[tokio::test]
async fn test_shared_subscription_receives_backlog() {
    let cluster = TestCluster::start(1).await;
    let client = cluster.client();
    let producer = publisher(&client, "t").await;
    for i in 1..=5 {
        assert_eq!(producer.publish(format!("m{i}")).await.unwrap(), i);
    }

    let mut sub = subscribe(&client, "t", SubscribeOptions::new("audit", SubscribeMode::Shared))
        .await
        .unwrap();
    let messages = receive_n(&mut sub, 5, WAIT).await;
    assert_eq!(msids(&messages), vec![1, 2, 3, 4, 5]);
    assert_eq!(messages[0].payload, "m1");
    assert_eq!(messages.iter().map(|m| m.mid).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

    sub.unsubscribe().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_second_exclusive_subscriber_is_rejected() {
    let cluster = TestCluster::start(1).await;
    let first = cluster.client();
    let second = cluster.client();

    let holder = subscribe(
        &first,
        "t",
        SubscribeOptions::new("excl", SubscribeMode::Exclusive).name("a"),
    )
    .await
    .unwrap();
    let err = subscribe(
        &second,
        "t",
        SubscribeOptions::new("excl", SubscribeMode::Exclusive).name("b"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::AlreadyOwned(_)), "{err:?}");

    // Once the holder leaves the name is free again.
    holder.unsubscribe().await.unwrap();
    let taken = subscribe(
        &second,
        "t",
        SubscribeOptions::new("excl", SubscribeMode::Exclusive).name("b"),
    )
    .await
    .unwrap();
    taken.unsubscribe().await.unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_mode_mismatch_is_rejected() {
    let cluster = TestCluster::start(1).await;
    let first = cluster.client();
    let second = cluster.client();

    let _shared = subscribe(&first, "t", SubscribeOptions::new("audit", SubscribeMode::Shared).name("a"))
        .await
        .unwrap();
    let err = subscribe(
        &second,
        "t",
        SubscribeOptions::new("audit", SubscribeMode::Exclusive).name("b"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::ModeConflict(_)), "{err:?}");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_shared_members_split_without_duplicates() {
    let cluster = TestCluster::start(1).await;
    let producer_client = cluster.client();
    let producer = publisher(&producer_client, "t").await;

    let mut subs = Vec::new();
    for name in ["a", "b"] {
        let client = cluster.client();
        subs.push(
            subscribe(&client, "t", SubscribeOptions::new("work", SubscribeMode::Shared).name(name))
                .await
                .unwrap(),
        );
    }
    for i in 0..8 {
        producer.publish(format!("job-{i}")).await.unwrap();
    }

    let seen = collect(&mut subs, 8).await;
    let all: Vec<Msid> = seen.iter().flatten().map(|(msid, _)| *msid).collect();
    let unique: BTreeSet<Msid> = all.iter().copied().collect();
    assert_eq!(all.len(), 8, "no message delivered twice");
    assert_eq!(unique, (1..=8).collect::<BTreeSet<_>>());
    for member in &seen {
        let ordered: Vec<Msid> = member.iter().map(|(msid, _)| *msid).collect();
        let mut sorted = ordered.clone();
        sorted.sort_unstable();
        assert_eq!(ordered, sorted, "each member sees msid order");
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_key_shared_pins_keys_to_members() {
    let cluster = TestCluster::start(1).await;
    let producer_client = cluster.client();
    let producer = publisher(&producer_client, "t").await;

    let mut subs = Vec::new();
    for name in ["a", "b"] {
        let client = cluster.client();
        subs.push(
            subscribe(&client, "t", SubscribeOptions::new("keyed", SubscribeMode::KeyShared).name(name))
                .await
                .unwrap(),
        );
    }
    for round in 0..3 {
        for key in ["k0", "k1", "k2", "k3"] {
            producer
                .publish_with_key(Some(key.to_string()), format!("{key}-{round}"))
                .await
                .unwrap();
        }
    }

    let seen = collect(&mut subs, 12).await;
    let mut owner_of: HashMap<String, usize> = HashMap::new();
    for (member, messages) in seen.iter().enumerate() {
        for (_, key) in messages {
            let key = key.clone().expect("keyed message");
            let owner = *owner_of.entry(key.clone()).or_insert(member);
            assert_eq!(owner, member, "key {key} went to two members");
        }
    }
    assert_eq!(owner_of.len(), 4);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failover_waiter_takes_over_from_persisted_offset() {
    let cluster = TestCluster::start(1).await;
    let producer_client = cluster.client();
    let producer = publisher(&producer_client, "t").await;
    let client_a = cluster.client();
    let client_b = cluster.client();

    let mut lead = subscribe(
        &client_a,
        "t",
        SubscribeOptions::new("fo", SubscribeMode::Failover).name("a"),
    )
    .await
    .unwrap();
    for i in 1..=3 {
        producer.publish(format!("m{i}")).await.unwrap();
    }
    assert_eq!(msids(&receive_n(&mut lead, 3, WAIT).await), vec![1, 2, 3]);

    let waiter_client = client_b.clone();
    let waiter = tokio::spawn(async move {
        subscribe(
            &waiter_client,
            "t",
            SubscribeOptions::new("fo", SubscribeMode::Failover)
                .name("b")
                .wait(Duration::from_secs(5)),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!waiter.is_finished(), "waiter blocks while the lead answers alive-checks");

    cluster.network.set_unreachable(client_a.url(), true);
    let mut follower = tokio::time::timeout(Duration::from_secs(3), waiter)
        .await
        .expect("waiter takes the lead")
        .unwrap()
        .unwrap();

    let broker = cluster.broker(0);
    let sub = broker.subscription("t", 1, "fo").await.unwrap();
    assert_eq!(sub.lead().await.as_deref(), Some("t:p1:subscriber:b"));
    assert_eq!(sub.members().await, vec!["t:p1:subscriber:b".to_string()]);
    assert_eq!(sub.record().await.push_offset, 4);
    let lead_path = broker.metadata().paths().subscription_leader("t", 1, "fo");
    assert_eq!(cluster.coordinator.deletion_count(&lead_path).await, 1);

    for i in 4..=5 {
        producer.publish(format!("m{i}")).await.unwrap();
    }
    assert_eq!(msids(&receive_n(&mut follower, 2, WAIT).await), vec![4, 5]);

    drop(lead);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failover_waiter_times_out_while_lead_alive() {
    let cluster = TestCluster::start(1).await;
    let client_a = cluster.client();
    let client_b = cluster.client_with(bundlemq::client::ClientConfig {
        max_redo: 0,
        ..common::client_config(&cluster.url(0))
    });

    let _lead = subscribe(
        &client_a,
        "t",
        SubscribeOptions::new("fo", SubscribeMode::Failover).name("a"),
    )
    .await
    .unwrap();
    let err = subscribe(
        &client_b,
        "t",
        SubscribeOptions::new("fo", SubscribeMode::Failover)
            .name("b")
            .wait(Duration::from_millis(100)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::MaxRedoExceeded(_) | Error::Timeout), "{err:?}");

    let sub = cluster.broker(0).subscription("t", 1, "fo").await.unwrap();
    assert_eq!(sub.lead().await.as_deref(), Some("t:p1:subscriber:a"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_resubscribe_does_not_redeliver() {
    let cluster = TestCluster::start(1).await;
    let client = cluster.client();
    let producer = publisher(&client, "t").await;
    for i in 1..=3 {
        producer.publish(format!("m{i}")).await.unwrap();
    }

    let mut first = subscribe(&client, "t", SubscribeOptions::new("audit", SubscribeMode::Shared))
        .await
        .unwrap();
    let messages = receive_n(&mut first, 3, WAIT).await;
    first.ack(&messages[2]).await.unwrap();
    first.unsubscribe().await.unwrap();

    for i in 4..=5 {
        producer.publish(format!("m{i}")).await.unwrap();
    }
    let mut second = subscribe(&client, "t", SubscribeOptions::new("audit", SubscribeMode::Shared))
        .await
        .unwrap();
    assert_eq!(msids(&receive_n(&mut second, 2, WAIT).await), vec![4, 5]);
    let extra = second.receive_timeout(Duration::from_millis(300)).await;
    assert_eq!(extra.unwrap_err(), Error::Timeout);

    second.unsubscribe().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_ack_of_unjoined_partition_is_rejected() {
    let cluster = TestCluster::start(1).await;
    let client = cluster.client();
    let sub = subscribe(&client, "t", SubscribeOptions::new("audit", SubscribeMode::Shared))
        .await
        .unwrap();
    let err = sub.ack_offset(7, 1).await.unwrap_err();
    assert!(err.is_not_found());
    sub.unsubscribe().await.unwrap();
    cluster.shutdown().await;
}
