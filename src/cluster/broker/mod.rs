//! The broker: request handling on top of the cluster building blocks.
//!
//! This module is split by request category:
//! - `routing` - lookup, allocation and topic info
//! - `connect` - connect, disconnect and publisher leadership
//! - `publish` - message publication
//! - `subscribe` - subscribe, pull, ack and unsubscribe
//!
//! Transports hand every decoded [`BrokerRequest`] to [`Broker::handle`]
//! together with the [`ClientSession`] it arrived on. The session carries the
//! link back to the client (used for deliveries and alive-checks) and a
//! token canceled when the client goes away, which ends any wait the
//! request is parked in.

mod connect;
mod publish;
mod routing;
mod subscribe;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bundle::{BundleRouter, BundleTable};
use super::config::BrokerConfig;
use super::connections::{ClientHandle, ConnectionTable};
use super::keys::StorePaths;
use super::leader::LeaderElection;
use super::lease::Lease;
use super::metadata::MetadataStore;
use super::metrics::{record_request, ACTIVE_CONNECTIONS};
use super::partition_state::{new_message_cache, MessageCache, PartitionState};
use super::subscription::{Crc32KeyRouter, KeyRouter, Subscription, SubscriptionContext};
use super::traits::{CoordinationStore, LogStore};
use super::validation::validate_partition;
use crate::error::{Error, Result};
use crate::protocol::{BrokerRequest, BrokerResponse, WireError};
use crate::redo::RedoPolicy;
use crate::transport::ClientLink;
use crate::types::{
    BrokerDescriptor, LeaderDescriptor, PartitionDescriptor, PartitionId, PublishMode,
    ResourceUsage,
};

/// The connection a request arrived on.
#[derive(Clone)]
pub struct ClientSession {
    pub link: Arc<dyn ClientLink>,
    pub cancel: CancellationToken,
}

impl ClientSession {
    pub fn new(link: Arc<dyn ClientLink>) -> Self {
        Self {
            link,
            cancel: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("url", &self.link.url())
            .field("canceled", &self.cancel.is_cancelled())
            .finish()
    }
}

pub(crate) struct LeadPublisher {
    name: String,
    client_id: String,
    lease: Arc<Lease>,
    epoch: u64,
    monitor: CancellationToken,
}

#[derive(Default)]
pub(crate) struct Publishers {
    lead: Option<LeadPublisher>,
    shared: BTreeMap<String, ClientHandle>,
    next_epoch: u64,
}

/// Everything the broker keeps for one served partition.
pub(crate) struct PartitionEntry {
    state: Arc<PartitionState>,
    publish_mode: PublishMode,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    publishers: Mutex<Publishers>,
}

pub struct Broker {
    config: BrokerConfig,
    url: String,
    metadata: MetadataStore,
    log: Arc<dyn LogStore>,
    cache: MessageCache,
    router: BundleRouter,
    election: Arc<LeaderElection>,
    connections: Arc<ConnectionTable>,
    partitions: DashMap<(String, PartitionId), Arc<PartitionEntry>>,
    key_router: Arc<dyn KeyRouter>,
    send_policy: RedoPolicy,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.config.name)
            .field("url", &self.url)
            .field("partitions", &self.partitions.len())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Validate config, register with the cluster and start background tasks.
    pub async fn start(
        config: BrokerConfig,
        coordinator: Arc<dyn CoordinationStore>,
        log: Arc<dyn LogStore>,
    ) -> Result<Arc<Self>> {
        Self::start_with_router(config, coordinator, log, Arc::new(Crc32KeyRouter)).await
    }

    /// Like [`Broker::start`] with a custom key-shared routing function.
    pub async fn start_with_router(
        config: BrokerConfig,
        coordinator: Arc<dyn CoordinationStore>,
        log: Arc<dyn LogStore>,
        key_router: Arc<dyn KeyRouter>,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;

        let url = config.url();
        let metadata = MetadataStore::new(coordinator, StorePaths::from_config(&config.coordination));

        let router = BundleRouter::new(BundleTable::even(config.bundles.count)?, metadata.clone());
        router.initialize().await?;

        metadata
            .register_broker(&BrokerDescriptor {
                name: config.name.clone(),
                host: config.host.clone(),
                port: config.port,
                usage: ResourceUsage::default(),
                load_index: 0.0,
            })
            .await?;

        let election = Arc::new(LeaderElection::new(
            metadata.clone(),
            LeaderDescriptor {
                name: config.name.clone(),
                url: url.clone(),
                term: String::new(),
            },
        ));
        election.campaign().await?;

        let cancel = CancellationToken::new();
        let election_task = Arc::clone(&election).spawn(cancel.child_token());

        info!(
            broker = %config.name,
            url = %url,
            bundles = router.table().len(),
            leader = election.is_leader().await,
            "Broker started"
        );

        Ok(Arc::new(Self {
            url,
            cache: new_message_cache(config.delivery.message_cache_capacity),
            send_policy: RedoPolicy::new(config.redo.max_redo, config.delivery.send_timeout()),
            connections: Arc::new(ConnectionTable::new(config.allow_rename)),
            partitions: DashMap::new(),
            tasks: std::sync::Mutex::new(vec![election_task]),
            config,
            metadata,
            log,
            router,
            election,
            key_router,
            cancel,
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub async fn is_leader(&self) -> bool {
        self.election.is_leader().await
    }

    /// True once [`Broker::shutdown`] has begun.
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of assigned client names.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Current persisted counters of a served partition.
    pub async fn partition_snapshot(&self, topic: &str, partition: PartitionId) -> Option<PartitionDescriptor> {
        let entry = self.served(topic, partition)?;
        Some(entry.state.snapshot().await)
    }

    pub async fn subscription(
        &self,
        topic: &str,
        partition: PartitionId,
        name: &str,
    ) -> Option<Arc<Subscription>> {
        let entry = self.served(topic, partition)?;
        let subs = entry.subscriptions.lock().await;
        subs.get(name).cloned()
    }

    /// Publish a fresh resource usage snapshot to the broker registry.
    pub async fn report_usage(&self, usage: ResourceUsage) -> Result<()> {
        for _ in 0..2 {
            let (mut descriptor, version) = self
                .metadata
                .get_broker(&self.config.name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("broker {}", self.config.name)))?;
            descriptor.usage = usage;
            descriptor.load_index = usage.load_index();
            match self.metadata.update_broker(&descriptor, version).await {
                Ok(_) => {
                    debug!(broker = %self.config.name, load_index = descriptor.load_index, "Reported usage");
                    return Ok(());
                }
                Err(Error::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!("broker {} usage", self.config.name)))
    }

    /// Dispatch one request and encode the outcome.
    pub async fn handle(&self, session: &ClientSession, request: BrokerRequest) -> BrokerResponse {
        let op = request.op_name();
        let started = Instant::now();
        let result = self.dispatch(session, request).await;
        record_request(op, result.is_ok(), started.elapsed().as_secs_f64());
        match result {
            Ok(response) => response,
            Err(e) => {
                debug!(op, error = %e, "Request failed");
                BrokerResponse::Error(WireError::from(&e))
            }
        }
    }

    async fn dispatch(&self, session: &ClientSession, request: BrokerRequest) -> Result<BrokerResponse> {
        Ok(match request {
            BrokerRequest::Lookup { topic, partition } => {
                BrokerResponse::Url(self.lookup(&topic, partition).await?)
            }
            BrokerRequest::RequestAlloc { topic, partition } => {
                BrokerResponse::Url(self.request_alloc(&topic, partition).await?)
            }
            BrokerRequest::Connect(req) => BrokerResponse::Name(self.connect(session, req).await?),
            BrokerRequest::Publish(req) => BrokerResponse::Msid(self.publish(req).await?),
            BrokerRequest::Subscribe(req) => {
                self.subscribe(session, req).await?;
                BrokerResponse::Ok
            }
            BrokerRequest::Pull(req) => BrokerResponse::Pulled(self.pull(session, req).await?),
            BrokerRequest::Ack(req) => {
                self.ack(req).await?;
                BrokerResponse::Ok
            }
            BrokerRequest::Unsubscribe(req) => {
                self.unsubscribe(req).await?;
                BrokerResponse::Ok
            }
            BrokerRequest::GetTopicInfo { topic } => {
                BrokerResponse::PartitionCount(self.get_topic_info(&topic).await?)
            }
            BrokerRequest::Disconnect { name } => {
                self.disconnect(&name).await?;
                BrokerResponse::Ok
            }
        })
    }

    /// Called by transports when a client connection opens and closes.
    pub fn session_opened(&self) {
        ACTIVE_CONNECTIONS.inc();
    }

    /// Cancels the session's waits and detaches the Shared/KeyShared
    /// members it carried, so their share of messages moves to live members.
    pub fn session_closed(self: &Arc<Self>, session: &ClientSession) {
        session.cancel.cancel();
        ACTIVE_CONNECTIONS.dec();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let broker = Arc::clone(self);
        let link = Arc::clone(&session.link);
        runtime.spawn(async move { broker.detach_link(&link).await });
    }

    pub(crate) async fn detach_link(&self, link: &Arc<dyn ClientLink>) {
        if self.is_stopping() {
            return;
        }
        let entries: Vec<Arc<PartitionEntry>> =
            self.partitions.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            let subs: Vec<Arc<Subscription>> =
                entry.subscriptions.lock().await.values().cloned().collect();
            for sub in subs {
                match sub.detach_link(link).await {
                    Ok(gone) => {
                        for name in gone {
                            self.connections.release(&name);
                        }
                    }
                    Err(e) => {
                        warn!(subscription = %sub.name(), error = %e, "Failed to detach closed connection");
                    }
                }
            }
        }
    }

    fn served(&self, topic: &str, partition: PartitionId) -> Option<Arc<PartitionEntry>> {
        self.partitions
            .get(&(topic.to_string(), partition))
            .map(|e| Arc::clone(e.value()))
    }

    /// The entry of a partition whose bundle this broker owns, opening it on
    /// first use.
    pub(crate) async fn partition(&self, topic: &str, partition: PartitionId) -> Result<Arc<PartitionEntry>> {
        if let Some(entry) = self.served(topic, partition) {
            return Ok(entry);
        }
        self.ensure_owned(topic, partition).await?;
        let descriptor = self
            .metadata
            .get_topic(topic)
            .await?
            .ok_or_else(|| Error::NotFound(format!("topic {topic}")))?;
        validate_partition(topic, partition, descriptor.partition_count)?;

        let state = PartitionState::open(
            topic,
            partition,
            self.metadata.clone(),
            Arc::clone(&self.log),
            self.cache.clone(),
        )
        .await?;
        let entry = Arc::new(PartitionEntry {
            state: Arc::new(state),
            publish_mode: descriptor.publish_mode,
            subscriptions: Mutex::new(HashMap::new()),
            publishers: Mutex::new(Publishers::default()),
        });
        // A concurrent opener may have won; keep the first entry.
        let entry = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_insert(entry)
            .value()
            .clone();
        info!(topic, partition, "Serving partition");
        Ok(entry)
    }

    pub(crate) fn subscription_context(&self) -> SubscriptionContext {
        SubscriptionContext {
            metadata: self.metadata.clone(),
            log: Arc::clone(&self.log),
            key_router: Arc::clone(&self.key_router),
            heartbeat: self.config.heartbeat,
        }
    }

    /// Stop background work and give up everything this broker holds.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let entries: Vec<Arc<PartitionEntry>> =
            self.partitions.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            let subs: Vec<Arc<Subscription>> =
                entry.subscriptions.lock().await.values().cloned().collect();
            for sub in subs {
                sub.shutdown().await;
            }
            let mut publishers = entry.publishers.lock().await;
            if let Some(lead) = publishers.lead.take() {
                lead.monitor.cancel();
                if let Err(e) = lead.lease.release().await {
                    warn!(publisher = %lead.name, error = %e, "Failed to release publisher lead");
                }
            }
        }

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            let _ = task.await;
        }

        self.election.resign().await?;
        match self
            .metadata
            .store()
            .delete(&self.metadata.paths().broker(&self.config.name), None)
            .await
        {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        info!(broker = %self.config.name, "Broker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryCoordinator, MemoryLogStore};
    use crate::error::ErrorCode;
    use crate::types::Delivery;
    use async_trait::async_trait;

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

    async fn broker(mem: &MemoryCoordinator, name: &str, port: u16) -> Arc<Broker> {
        let config = BrokerConfig {
            name: name.to_string(),
            port,
            ..Default::default()
        };
        Broker::start(config, Arc::new(mem.new_session()), Arc::new(MemoryLogStore::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_registers_and_leads() {
        let mem = MemoryCoordinator::new();
        let b = broker(&mem, "b0", 7100).await;
        assert!(b.is_leader().await);
        assert!(!b.is_stopping());
        let brokers = b.metadata().list_brokers().await.unwrap();
        assert_eq!(brokers.len(), 1);
        assert_eq!(brokers[0].url(), "127.0.0.1:7100");
    }

    #[tokio::test]
    async fn test_invalid_config_refused() {
        let mem = MemoryCoordinator::new();
        let config = BrokerConfig {
            port: 0,
            ..Default::default()
        };
        let err = Broker::start(config, Arc::new(mem), Arc::new(MemoryLogStore::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_handle_encodes_routing_errors() {
        let mem = MemoryCoordinator::new();
        let b = broker(&mem, "b0", 7100).await;
        let session = ClientSession::new(Arc::new(NullLink));

        let response = b
            .handle(
                &session,
                BrokerRequest::Lookup {
                    topic: "t".into(),
                    partition: 1,
                },
            )
            .await;
        match response {
            BrokerResponse::Error(wire) => {
                assert_eq!(wire.code, ErrorCode::NeedAllocation as i16);
                assert_eq!(wire.leader_url.as_deref(), Some("127.0.0.1:7100"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let response = b
            .handle(
                &session,
                BrokerRequest::RequestAlloc {
                    topic: "t".into(),
                    partition: 1,
                },
            )
            .await;
        assert_eq!(response, BrokerResponse::Url("127.0.0.1:7100".into()));
    }

    #[tokio::test]
    async fn test_second_broker_follows() {
        let mem = MemoryCoordinator::new();
        let first = broker(&mem, "b0", 7100).await;
        let second = broker(&mem, "b1", 7101).await;
        assert!(first.is_leader().await);
        assert!(!second.is_leader().await);
        assert_eq!(first.metadata().list_brokers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_deregisters() {
        let mem = MemoryCoordinator::new();
        let first = broker(&mem, "b0", 7100).await;
        let second = broker(&mem, "b1", 7101).await;

        first.shutdown().await.unwrap();
        assert!(first.is_stopping());
        let names: Vec<String> = second
            .metadata()
            .list_brokers()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn test_lead_takeover_waits_for_in_flight_publishes() {
        use crate::protocol::{ConnectRequest, PublishRequest};
        use crate::types::ClientRole;

        let mem = MemoryCoordinator::new();
        let b = broker(&mem, "b0", 7100).await;
        let session = ClientSession::new(Arc::new(NullLink));
        let alloc = b
            .handle(
                &session,
                BrokerRequest::RequestAlloc {
                    topic: "t".into(),
                    partition: 1,
                },
            )
            .await;
        assert_eq!(alloc, BrokerResponse::Url("127.0.0.1:7100".into()));
        let name = b
            .connect(
                &session,
                ConnectRequest {
                    client_id: "c1".into(),
                    name: "lead".into(),
                    url: "client-null".into(),
                    topic: "t".into(),
                    partition: 1,
                    partition_count: 1,
                    role: ClientRole::Publisher,
                    publish_mode: PublishMode::Exclusive,
                    timeout_ms: 0,
                },
            )
            .await
            .unwrap();

        let inflight: Vec<_> = (1..=16i64)
            .map(|mid| {
                let b = Arc::clone(&b);
                let name = name.clone();
                tokio::spawn(async move {
                    b.publish(PublishRequest {
                        name,
                        topic: "t".into(),
                        partition: 1,
                        mid,
                        key: None,
                        payload: bytes::Bytes::from_static(b"m"),
                    })
                    .await
                })
            })
            .collect();
        tokio::task::yield_now().await;

        // Revoke the lead the way the alive-check does.
        let entry = b.served("t", 1).unwrap();
        let committed = {
            let mut publishers = entry.publishers.lock().await;
            let count = entry.state.snapshot().await.message_count;
            let lead = publishers.lead.take().unwrap();
            lead.monitor.cancel();
            lead.lease.release().await.unwrap();
            count
        };

        for task in inflight {
            match task.await.unwrap() {
                Ok(msid) => assert!(msid <= committed, "msid {msid} landed after the takeover"),
                Err(e) => assert!(e.is_not_found(), "unexpected {e:?}"),
            }
        }
        assert_eq!(entry.state.snapshot().await.message_count, committed);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_name() {
        let mem = MemoryCoordinator::new();
        let b = broker(&mem, "b0", 7100).await;
        let err = b.disconnect("t:p1:publisher:nobody").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
