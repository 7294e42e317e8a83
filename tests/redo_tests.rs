//! Timeouts, redo budgets and recovery after a peer comes back.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bundlemq::client::{Client, Publisher};
use bundlemq::redo::RedoPolicy;
use bundlemq::transport::local::LocalNetwork;
use bundlemq::transport::{BrokerDialer, BrokerService, ClientLink};
use bundlemq::types::PublishMode;
use bundlemq::{Error, Result};

use common::TestCluster;

/// Counts dials and forwards to an inner network.
struct CountingDialer {
    inner: LocalNetwork,
    dials: AtomicU32,
}

#[async_trait]
impl BrokerDialer for CountingDialer {
    async fn dial(&self, url: &str, endpoint: Arc<dyn ClientLink>) -> Result<Arc<dyn BrokerService>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(url, endpoint).await
    }
}

#[tokio::test]
async fn test_unreachable_bootstrap_exhausts_redo_budget() {
    let cluster = TestCluster::start(1).await;
    let dialer = Arc::new(CountingDialer {
        inner: cluster.network.clone(),
        dials: AtomicU32::new(0),
    });
    let client = Client::new(common::client_config(&cluster.url(0)), dialer.clone());

    cluster.network.set_unreachable(&cluster.url(0), true);
    let err = client.locate("t", 1).await.unwrap_err();
    assert!(matches!(err, Error::MaxRedoExceeded(_)), "{err:?}");
    // max_redo = 2: one attempt plus two redos.
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 3);

    cluster.network.set_unreachable(&cluster.url(0), false);
    assert_eq!(client.locate("t", 1).await.unwrap(), cluster.url(0));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_publisher_recovers_after_broker_returns() {
    let cluster = TestCluster::start(1).await;
    let client = cluster.client();
    let publisher = Publisher::connect(&client, "t", 1, "p", PublishMode::Shared)
        .await
        .unwrap();
    assert_eq!(publisher.publish("one").await.unwrap(), 1);

    cluster.network.set_unreachable(&cluster.url(0), true);
    let err = publisher.publish("lost").await.unwrap_err();
    assert!(matches!(err, Error::MaxRedoExceeded(_)), "{err:?}");

    cluster.network.set_unreachable(&cluster.url(0), false);
    assert_eq!(publisher.publish("two").await.unwrap(), 2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_non_timeout_errors_are_not_redone() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RedoPolicy::new(5, Duration::from_millis(100));
    let c = calls.clone();
    let result: Result<()> = policy
        .run("connect", move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::AlreadyOwned("lead".into()))
            }
        })
        .await;
    assert_eq!(result, Err(Error::AlreadyOwned("lead".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_attempts_are_cut_by_deadline() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RedoPolicy::new(1, Duration::from_millis(250));
    let c = calls.clone();
    let started = tokio::time::Instant::now();
    let result: Result<()> = policy
        .run("pull", move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
                Ok(())
            }
        })
        .await;
    assert!(matches!(result, Err(Error::MaxRedoExceeded(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(600));
}
