//! Client library.
//!
//! A [`Client`] holds one connection per broker it talks to, shared by every
//! publisher and subscriber created from it. Every call goes through the
//! redo policy; lookups follow `NeedAllocation` redirects to the cluster
//! leader transparently.
//!
//! ```rust,no_run
//! use bundlemq::client::{Client, ClientConfig, Publisher, Subscriber, SubscribeOptions};
//! use bundlemq::types::{PublishMode, SubscribeMode};
//!
//! # async fn run() -> bundlemq::Result<()> {
//! let client = Client::tcp(ClientConfig::new("127.0.0.1:7100"));
//! let publisher = Publisher::connect(&client, "orders", 1, "checkout", PublishMode::Shared).await?;
//! publisher.publish("hello").await?;
//!
//! let mut subscriber = Subscriber::subscribe(
//!     &client,
//!     "orders",
//!     Some(1),
//!     SubscribeOptions::new("billing", SubscribeMode::Shared),
//! )
//! .await?;
//! let message = subscriber.receive().await?;
//! subscriber.ack(&message).await?;
//! # Ok(())
//! # }
//! ```

mod partitioned;
mod publisher;
mod subscriber;

pub use partitioned::{PartitionRouting, PartitionedPublisher};
pub use publisher::{AsyncPublisher, PendingPublish, Publisher};
pub use subscriber::{SubscribeOptions, Subscriber};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::constants::{
    DEFAULT_MAX_REDO, DEFAULT_OPERATION_TIMEOUT_MS, MAX_ALLOCATION_REDIRECTS,
    WAIT_DEADLINE_SLACK_MS,
};
use crate::error::{Error, Result};
use crate::protocol::ConnectRequest;
use crate::redo::RedoPolicy;
use crate::transport::tcp::TcpDialer;
use crate::transport::{BrokerDialer, BrokerService, ClientLink};
use crate::types::{ClientRole, Delivery, Message, PartitionId, PublishMode};

/// Default capacity of a subscriber's receive queue.
pub const DEFAULT_RECEIVE_QUEUE_SIZE: usize = 1_000;

/// Default server-side wait of one pull, in milliseconds.
pub const DEFAULT_PULL_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Any broker of the cluster; used for lookups and topic info.
    pub bootstrap_url: String,
    /// Address reported to brokers. Defaults to `client-<client id>`.
    pub client_url: Option<String>,
    pub operation_timeout_ms: u64,
    pub max_redo: u32,
    pub receive_queue_size: usize,
    pub pull_timeout_ms: u64,
    /// Partition count used when a connect creates the topic.
    pub default_partition_count: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_url: String::new(),
            client_url: None,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            max_redo: DEFAULT_MAX_REDO,
            receive_queue_size: DEFAULT_RECEIVE_QUEUE_SIZE,
            pull_timeout_ms: DEFAULT_PULL_TIMEOUT_MS,
            default_partition_count: 1,
        }
    }
}

impl ClientConfig {
    pub fn new(bootstrap_url: impl Into<String>) -> Self {
        Self {
            bootstrap_url: bootstrap_url.into(),
            ..Default::default()
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}

/// Per-subscription receive queues, keyed by where the delivery came from.
type QueueKey = (String, PartitionId, String);

/// The client's side of every broker connection: accepts pushes.
struct ClientEndpoint {
    url: String,
    queues: DashMap<QueueKey, mpsc::Sender<Message>>,
}

#[async_trait]
impl ClientLink for ClientEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        let key = (
            delivery.message.topic.clone(),
            delivery.message.partition,
            delivery.subscription,
        );
        let queue = self
            .queues
            .get(&key)
            .map(|q| q.value().clone())
            .ok_or_else(|| Error::NotFound(format!("subscription {} on {}/p{}", key.2, key.0, key.1)))?;
        queue.try_send(delivery.message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::BufferFull,
            mpsc::error::TrySendError::Closed(_) => {
                Error::NotFound(format!("subscription {} closed", key.2))
            }
        })
    }

    async fn alive_check(&self) -> Result<()> {
        Ok(())
    }
}

/// A client's registration on one partition.
#[derive(Clone)]
pub(crate) struct Connection {
    pub(crate) url: String,
    pub(crate) name: String,
    pub(crate) service: Arc<dyn BrokerService>,
}

pub(crate) struct ConnectSpec<'a> {
    pub(crate) topic: &'a str,
    pub(crate) partition: PartitionId,
    pub(crate) name: &'a str,
    pub(crate) role: ClientRole,
    pub(crate) publish_mode: PublishMode,
    pub(crate) wait: Duration,
}

struct ClientInner {
    config: ClientConfig,
    client_id: String,
    dialer: Arc<dyn BrokerDialer>,
    endpoint: Arc<ClientEndpoint>,
    services: DashMap<String, Arc<dyn BrokerService>>,
    redo: RedoPolicy,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.client_id)
            .field("bootstrap_url", &self.inner.config.bootstrap_url)
            .field("connections", &self.inner.services.len())
            .finish()
    }
}

impl Client {
    pub fn new(config: ClientConfig, dialer: Arc<dyn BrokerDialer>) -> Self {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = config
            .client_url
            .clone()
            .unwrap_or_else(|| format!("client-{client_id}"));
        let redo = RedoPolicy::new(config.max_redo, config.operation_timeout());
        Self {
            inner: Arc::new(ClientInner {
                endpoint: Arc::new(ClientEndpoint {
                    url,
                    queues: DashMap::new(),
                }),
                services: DashMap::new(),
                config,
                client_id,
                dialer,
                redo,
            }),
        }
    }

    /// A client talking to brokers over TCP.
    pub fn tcp(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(TcpDialer))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Stable id sent with every connect; a reconnect with the same id takes
    /// over the names this client held.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Address this client reports to brokers.
    pub fn url(&self) -> &str {
        &self.inner.endpoint.url
    }

    pub fn redo(&self) -> RedoPolicy {
        self.inner.redo
    }

    /// The cached connection to `url`, dialing on first use.
    pub async fn service(&self, url: &str) -> Result<Arc<dyn BrokerService>> {
        if let Some(service) = self.inner.services.get(url) {
            return Ok(Arc::clone(service.value()));
        }
        let endpoint: Arc<dyn ClientLink> = self.inner.endpoint.clone();
        let service = self
            .inner
            .redo
            .run("dial", |_| {
                let dialer = Arc::clone(&self.inner.dialer);
                let endpoint = Arc::clone(&endpoint);
                async move { dialer.dial(url, endpoint).await }
            })
            .await?;
        let service = self
            .inner
            .services
            .entry(url.to_string())
            .or_insert(service)
            .value()
            .clone();
        debug!(url, "Dialed broker");
        Ok(service)
    }

    /// Drop the cached connection to `url`; the next call dials again.
    pub fn forget(&self, url: &str) {
        if self.inner.services.remove(url).is_some() {
            debug!(url, "Dropped broker connection");
        }
    }

    /// Run `op` against the broker at `url` under the redo policy.
    pub(crate) async fn call<T, F, Fut>(&self, url: &str, op_name: &str, policy: RedoPolicy, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn BrokerService>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let service = self.service(url).await?;
        let result = policy.run(op_name, |_| op(Arc::clone(&service))).await;
        if let Err(Error::Transport(_) | Error::MaxRedoExceeded(_)) = &result {
            self.forget(url);
        }
        result
    }

    /// Redo policy for a call the broker may park for up to `wait`.
    pub(crate) fn waiting_redo(&self, wait: Duration) -> RedoPolicy {
        self.inner
            .redo
            .with_attempt_timeout(wait + Duration::from_millis(WAIT_DEADLINE_SLACK_MS))
    }

    /// URL of the broker owning `(topic, partition)`.
    ///
    /// An unowned bundle is allocated through the cluster leader the lookup
    /// points at, following up to [`MAX_ALLOCATION_REDIRECTS`] leader
    /// changes.
    pub async fn locate(&self, topic: &str, partition: PartitionId) -> Result<String> {
        let bootstrap = self.inner.config.bootstrap_url.clone();
        let redo = self.inner.redo;
        let lookup = self
            .call(&bootstrap, "lookup", redo, |service| async move {
                service.lookup(topic, partition).await
            })
            .await;
        let mut leader_url = match lookup {
            Ok(url) => return Ok(url),
            Err(Error::NeedAllocation { leader_url }) => leader_url,
            Err(e) => return Err(e),
        };

        for _ in 0..MAX_ALLOCATION_REDIRECTS {
            debug!(topic, partition, leader = %leader_url, "Requesting allocation");
            let alloc = self
                .call(&leader_url, "request_alloc", redo, |service| async move {
                    service.request_alloc(topic, partition).await
                })
                .await;
            match alloc {
                Ok(url) => {
                    info!(topic, partition, owner = %url, "Partition allocated");
                    return Ok(url);
                }
                Err(Error::NeedAllocation { leader_url: next }) => leader_url = next,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NeedAllocation { leader_url })
    }

    /// Partition count of `topic`.
    pub async fn topic_partitions(&self, topic: &str) -> Result<u32> {
        let bootstrap = self.inner.config.bootstrap_url.clone();
        self.call(&bootstrap, "get_topic_info", self.inner.redo, |service| async move {
            service.get_topic_info(topic).await
        })
        .await
    }

    /// Locate the owner of a partition and register there.
    pub(crate) async fn connect(&self, target: ConnectSpec<'_>) -> Result<Connection> {
        let url = self.locate(target.topic, target.partition).await?;
        let request = ConnectRequest {
            client_id: self.inner.client_id.clone(),
            name: target.name.to_string(),
            url: self.url().to_string(),
            topic: target.topic.to_string(),
            partition: target.partition,
            partition_count: self.inner.config.default_partition_count.max(target.partition),
            role: target.role,
            publish_mode: target.publish_mode,
            timeout_ms: target.wait.as_millis() as u64,
        };
        let name = self
            .call(&url, "connect", self.waiting_redo(target.wait), |service| {
                let request = request.clone();
                async move { service.connect(request).await }
            })
            .await?;
        let service = self.service(&url).await?;
        debug!(%url, %name, role = %target.role, "Connected");
        Ok(Connection { url, name, service })
    }

    pub(crate) async fn disconnect(&self, connection: &Connection) -> Result<()> {
        self.call(&connection.url, "disconnect", self.inner.redo, |service| async move {
            service.disconnect(&connection.name).await
        })
        .await
    }

    pub(crate) fn register_queue(&self, topic: &str, partition: PartitionId, subscription: &str, queue: mpsc::Sender<Message>) {
        self.inner
            .endpoint
            .queues
            .insert((topic.to_string(), partition, subscription.to_string()), queue);
    }

    pub(crate) fn remove_queue(&self, topic: &str, partition: PartitionId, subscription: &str) {
        self.inner
            .endpoint
            .queues
            .remove(&(topic.to_string(), partition, subscription.to_string()));
    }
}
