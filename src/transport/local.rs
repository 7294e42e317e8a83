//! In-process transport.
//!
//! Brokers register with a [`LocalNetwork`] under their URL; clients dial
//! them through it like they would over TCP. Every call is dispatched through
//! [`Broker::handle`] on its own task, so a caller giving up on a request does
//! not abort the broker's handling of it.
//!
//! Any URL (broker or client) can be marked unreachable. Calls towards an
//! unreachable peer fail with [`Error::Timeout`], which is what a silent peer
//! looks like to the redo wrapper and to heartbeat monitors.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{BrokerDialer, BrokerService, ClientLink, RequestChannel};
use crate::cluster::{Broker, ClientSession};
use crate::error::{Error, Result};
use crate::protocol::{BrokerRequest, BrokerResponse};
use crate::types::Delivery;

#[derive(Default)]
struct NetworkInner {
    brokers: DashMap<String, Arc<Broker>>,
    unreachable: RwLock<HashSet<String>>,
}

/// Registry of in-process brokers plus fault injection.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `broker` reachable at its URL.
    pub fn register(&self, broker: Arc<Broker>) {
        self.inner.brokers.insert(broker.url().to_string(), broker);
    }

    pub fn deregister(&self, url: &str) -> Option<Arc<Broker>> {
        self.inner.brokers.remove(url).map(|(_, broker)| broker)
    }

    pub fn broker(&self, url: &str) -> Option<Arc<Broker>> {
        self.inner.brokers.get(url).map(|b| Arc::clone(b.value()))
    }

    /// Drop (or restore) all traffic towards `url`.
    pub fn set_unreachable(&self, url: &str, unreachable: bool) {
        let mut set = match self.inner.unreachable.write() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        if unreachable {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
        debug!(url, unreachable, "Changed reachability");
    }

    pub fn is_reachable(&self, url: &str) -> bool {
        match self.inner.unreachable.read() {
            Ok(set) => !set.contains(url),
            Err(poisoned) => !poisoned.into_inner().contains(url),
        }
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("brokers", &self.inner.brokers.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerDialer for LocalNetwork {
    async fn dial(&self, url: &str, endpoint: Arc<dyn ClientLink>) -> Result<Arc<dyn BrokerService>> {
        if !self.is_reachable(url) {
            return Err(Error::Timeout);
        }
        let broker = self
            .broker(url)
            .ok_or_else(|| Error::Transport(format!("no broker listening at {url}")))?;
        let link = LocalLink {
            network: self.clone(),
            endpoint,
        };
        let session = ClientSession::new(Arc::new(link));
        broker.session_opened();
        Ok(Arc::new(LocalConnection {
            network: self.clone(),
            broker,
            session,
        }))
    }
}

/// Broker to client direction.
struct LocalLink {
    network: LocalNetwork,
    endpoint: Arc<dyn ClientLink>,
}

#[async_trait]
impl ClientLink for LocalLink {
    fn url(&self) -> &str {
        self.endpoint.url()
    }

    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        if !self.network.is_reachable(self.endpoint.url()) {
            return Err(Error::Timeout);
        }
        self.endpoint.deliver(delivery).await
    }

    async fn alive_check(&self) -> Result<()> {
        if !self.network.is_reachable(self.endpoint.url()) {
            return Err(Error::Timeout);
        }
        self.endpoint.alive_check().await
    }
}

/// Client to broker direction. Dropping it closes the session.
struct LocalConnection {
    network: LocalNetwork,
    broker: Arc<Broker>,
    session: ClientSession,
}

#[async_trait]
impl RequestChannel for LocalConnection {
    async fn call(&self, request: BrokerRequest) -> Result<BrokerResponse> {
        if !self.network.is_reachable(self.broker.url()) {
            return Err(Error::Timeout);
        }
        let broker = Arc::clone(&self.broker);
        let session = self.session.clone();
        tokio::spawn(async move { broker.handle(&session, request).await })
            .await
            .map_err(|e| Error::Transport(format!("request task failed: {e}")))
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.broker.session_closed(&self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{BrokerConfig, MemoryCoordinator, MemoryLogStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEndpoint {
        url: String,
        checks: AtomicUsize,
    }

    #[async_trait]
    impl ClientLink for CountingEndpoint {
        fn url(&self) -> &str {
            &self.url
        }

        async fn deliver(&self, _delivery: Delivery) -> Result<()> {
            Ok(())
        }

        async fn alive_check(&self) -> Result<()> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn network_with_broker() -> (LocalNetwork, Arc<Broker>) {
        let broker = Broker::start(
            BrokerConfig::default(),
            Arc::new(MemoryCoordinator::new()),
            Arc::new(MemoryLogStore::new()),
        )
        .await
        .unwrap();
        let network = LocalNetwork::new();
        network.register(Arc::clone(&broker));
        (network, broker)
    }

    fn endpoint(url: &str) -> Arc<CountingEndpoint> {
        Arc::new(CountingEndpoint {
            url: url.to_string(),
            checks: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_dial_unknown_url_fails() {
        let network = LocalNetwork::new();
        let err = network
            .dial("nowhere:1", endpoint("client:1"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_calls_reach_broker() {
        let (network, broker) = network_with_broker().await;
        let service = network.dial(broker.url(), endpoint("client:1")).await.unwrap();

        let err = service.get_topic_info("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_unreachable_broker_times_out() {
        let (network, broker) = network_with_broker().await;
        let service = network.dial(broker.url(), endpoint("client:1")).await.unwrap();

        network.set_unreachable(broker.url(), true);
        assert_eq!(service.get_topic_info("t").await, Err(Error::Timeout));
        assert!(matches!(
            network.dial(broker.url(), endpoint("client:2")).await.err(),
            Some(Error::Timeout)
        ));

        network.set_unreachable(broker.url(), false);
        assert!(service.get_topic_info("t").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unreachable_client_fails_alive_check() {
        let network = LocalNetwork::new();
        let client = endpoint("client:1");
        let link = LocalLink {
            network: network.clone(),
            endpoint: client.clone(),
        };

        link.alive_check().await.unwrap();
        network.set_unreachable("client:1", true);
        assert_eq!(link.alive_check().await, Err(Error::Timeout));
        assert_eq!(client.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_connection_cancels_session() {
        let (network, broker) = network_with_broker().await;
        let client = endpoint("client:1");
        let link = LocalLink {
            network: network.clone(),
            endpoint: client,
        };
        let session = ClientSession::new(Arc::new(link));
        let cancel = session.cancel.clone();
        let connection = LocalConnection {
            network,
            broker,
            session,
        };

        assert!(!cancel.is_cancelled());
        drop(connection);
        assert!(cancel.is_cancelled());
    }
}
