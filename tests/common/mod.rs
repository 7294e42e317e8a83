//! Shared harness for integration tests.
//!
//! Starts brokers on one coordination tree and one log store, registered on
//! a [`LocalNetwork`]. Broker `i` is named `broker-i` and listens (nominally)
//! on port `7100 + i`. The first broker started wins the leader election.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bundlemq::client::{Client, ClientConfig, Subscriber};
use bundlemq::cluster::{
    Broker, BrokerConfig, HeartbeatConfig, LogStore, MemoryCoordinator, MemoryLogStore, RedoConfig,
};
use bundlemq::transport::local::LocalNetwork;
use bundlemq::types::{Message, Msid};

pub const HEARTBEAT_INTERVAL_MS: u64 = 20;
pub const FAILURE_THRESHOLD: u32 = 3;

pub fn broker_config(index: usize) -> BrokerConfig {
    let mut config = BrokerConfig {
        name: format!("broker-{index}"),
        port: 7100 + index as u16,
        health_port: 0,
        ..Default::default()
    };
    config.heartbeat = HeartbeatConfig {
        interval_ms: HEARTBEAT_INTERVAL_MS,
        failure_threshold: FAILURE_THRESHOLD,
        check_timeout_ms: 10,
    };
    config.redo = RedoConfig {
        max_redo: 2,
        operation_timeout_ms: 500,
    };
    config.delivery.send_timeout_ms = 100;
    config
}

pub fn client_config(bootstrap: &str) -> ClientConfig {
    ClientConfig {
        operation_timeout_ms: 1_000,
        max_redo: 2,
        pull_timeout_ms: 200,
        ..ClientConfig::new(bootstrap)
    }
}

pub struct TestCluster {
    pub network: LocalNetwork,
    pub coordinator: MemoryCoordinator,
    pub log: Arc<MemoryLogStore>,
    pub brokers: Vec<Arc<Broker>>,
}

impl TestCluster {
    pub async fn start(size: usize) -> Self {
        Self::start_with(size, broker_config).await
    }

    pub async fn start_with(size: usize, config: impl Fn(usize) -> BrokerConfig) -> Self {
        let coordinator = MemoryCoordinator::new();
        let log = Arc::new(MemoryLogStore::new());
        let network = LocalNetwork::new();
        let mut brokers = Vec::with_capacity(size);
        for index in 0..size {
            let store: Arc<dyn LogStore> = log.clone();
            let broker = Broker::start(config(index), Arc::new(coordinator.new_session()), store)
                .await
                .expect("broker starts");
            network.register(Arc::clone(&broker));
            brokers.push(broker);
        }
        Self {
            network,
            coordinator,
            log,
            brokers,
        }
    }

    pub fn broker(&self, index: usize) -> &Arc<Broker> {
        &self.brokers[index]
    }

    pub fn url(&self, index: usize) -> String {
        self.brokers[index].url().to_string()
    }

    /// A client bootstrapped at broker 0.
    pub fn client(&self) -> Client {
        self.client_with(client_config(&self.url(0)))
    }

    pub fn client_with(&self, config: ClientConfig) -> Client {
        Client::new(config, Arc::new(self.network.clone()))
    }

    /// The broker serving `url`.
    pub fn owner(&self, url: &str) -> Arc<Broker> {
        self.network.broker(url).expect("owner is registered")
    }

    pub async fn shutdown(self) {
        for broker in self.brokers {
            broker.shutdown().await.expect("broker shuts down");
        }
    }
}

/// Receive `count` messages, failing the test if any takes longer than
/// `timeout`.
pub async fn receive_n(subscriber: &mut Subscriber, count: usize, timeout: Duration) -> Vec<Message> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let message = subscriber
            .receive_timeout(timeout)
            .await
            .expect("message arrives in time");
        out.push(message);
    }
    out
}

pub fn msids(messages: &[Message]) -> Vec<Msid> {
    messages.iter().map(|m| m.msid).collect()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
