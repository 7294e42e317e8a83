//! Typed façade over the coordination store.
//!
//! Everything above this module talks in descriptors; this module owns the
//! JSON encoding and the path layout from [`StorePaths`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::keys::StorePaths;
use super::traits::{CoordinationStore, NodeKind, Version, WatchEvent};
use crate::error::{Error, Result};
use crate::types::{
    BrokerDescriptor, BundleDescriptor, LeaderDescriptor, PartitionDescriptor, PartitionId,
    SubscriptionDescriptor, TopicDescriptor,
};

#[derive(Clone)]
pub struct MetadataStore {
    store: Arc<dyn CoordinationStore>,
    paths: StorePaths,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl MetadataStore {
    pub fn new(store: Arc<dyn CoordinationStore>, paths: StorePaths) -> Self {
        Self { store, paths }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    // ========================================================================
    // JSON helpers
    // ========================================================================

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<(T, Version)>> {
        match self.store.get(path).await {
            Ok(data) => Ok(Some((serde_json::from_slice(&data.value)?, data.version))),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_json<T: Serialize>(&self, path: &str, value: &T, kind: NodeKind) -> Result<()> {
        let body = Bytes::from(serde_json::to_vec(value)?);
        self.store.create(path, body, kind).await
    }

    pub async fn update_json<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        expected: Version,
    ) -> Result<Version> {
        let body = Bytes::from(serde_json::to_vec(value)?);
        self.store.update(path, body, expected).await
    }

    /// Create unless present; either way return what is stored.
    async fn get_or_create<T>(&self, path: &str, value: &T) -> Result<(T, Version)>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        match self.create_json(path, value, NodeKind::Persistent).await {
            Ok(()) => Ok((value.clone(), 0)),
            Err(Error::NodeExists(_)) => self
                .get_json(path)
                .await?
                .ok_or_else(|| Error::NotFound(path.to_string())),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Topics and partitions
    // ========================================================================

    pub async fn get_topic(&self, topic: &str) -> Result<Option<TopicDescriptor>> {
        Ok(self
            .get_json(&self.paths.topic(topic))
            .await?
            .map(|(t, _)| t))
    }

    /// Register a topic. A concurrent registration wins; its descriptor is returned.
    pub async fn register_topic(&self, descriptor: &TopicDescriptor) -> Result<TopicDescriptor> {
        let (stored, _) = self
            .get_or_create(&self.paths.topic(&descriptor.name), descriptor)
            .await?;
        Ok(stored)
    }

    pub async fn list_topics(&self) -> Result<Vec<String>> {
        self.store.list_children(self.paths.topic_root()).await
    }

    pub async fn get_partition(
        &self,
        topic: &str,
        partition: PartitionId,
    ) -> Result<Option<(PartitionDescriptor, Version)>> {
        self.get_json(&self.paths.partition(topic, partition)).await
    }

    /// Read the partition descriptor, creating a zeroed one if missing.
    pub async fn ensure_partition(
        &self,
        topic: &str,
        partition: PartitionId,
    ) -> Result<(PartitionDescriptor, Version)> {
        let fresh = PartitionDescriptor {
            topic: topic.to_string(),
            partition,
            ..Default::default()
        };
        self.get_or_create(&self.paths.partition(topic, partition), &fresh)
            .await
    }

    pub async fn update_partition(
        &self,
        descriptor: &PartitionDescriptor,
        expected: Version,
    ) -> Result<Version> {
        self.update_json(
            &self.paths.partition(&descriptor.topic, descriptor.partition),
            descriptor,
            expected,
        )
        .await
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub async fn get_subscription(
        &self,
        topic: &str,
        partition: PartitionId,
        name: &str,
    ) -> Result<Option<(SubscriptionDescriptor, Version)>> {
        self.get_json(&self.paths.subscription(topic, partition, name))
            .await
    }

    pub async fn ensure_subscription(
        &self,
        descriptor: &SubscriptionDescriptor,
    ) -> Result<(SubscriptionDescriptor, Version)> {
        let path = self
            .paths
            .subscription(&descriptor.topic, descriptor.partition, &descriptor.name);
        self.get_or_create(&path, descriptor).await
    }

    pub async fn update_subscription(
        &self,
        descriptor: &SubscriptionDescriptor,
        expected: Version,
    ) -> Result<Version> {
        let path = self
            .paths
            .subscription(&descriptor.topic, descriptor.partition, &descriptor.name);
        self.update_json(&path, descriptor, expected).await
    }

    pub async fn delete_subscription(&self, topic: &str, partition: PartitionId, name: &str) -> Result<()> {
        match self
            .store
            .delete(&self.paths.subscription(topic, partition, name), None)
            .await
        {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Persistent bookkeeping node for a shared or key-shared member.
    pub async fn register_member(
        &self,
        topic: &str,
        partition: PartitionId,
        sub: &str,
        member: &str,
    ) -> Result<()> {
        let path = self.paths.subscription_member(topic, partition, sub, member);
        match self.store.create_persistent(&path, Bytes::new()).await {
            Ok(()) | Err(Error::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn remove_member(
        &self,
        topic: &str,
        partition: PartitionId,
        sub: &str,
        member: &str,
    ) -> Result<()> {
        let path = self.paths.subscription_member(topic, partition, sub, member);
        match self.store.delete(&path, None).await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Publishers
    // ========================================================================

    pub async fn register_publisher(&self, topic: &str, partition: PartitionId, client: &str) -> Result<()> {
        let path = self.paths.publisher(topic, partition, client);
        match self.store.create_persistent(&path, Bytes::new()).await {
            Ok(()) | Err(Error::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn remove_publisher(&self, topic: &str, partition: PartitionId, client: &str) -> Result<()> {
        let path = self.paths.publisher(topic, partition, client);
        match self.store.delete(&path, None).await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Bundles
    // ========================================================================

    pub async fn get_bundle(&self, id: u32) -> Result<Option<(BundleDescriptor, Version)>> {
        self.get_json(&self.paths.bundle(id)).await
    }

    pub async fn ensure_bundle(&self, descriptor: &BundleDescriptor) -> Result<(BundleDescriptor, Version)> {
        self.get_or_create(&self.paths.bundle(descriptor.id), descriptor)
            .await
    }

    pub async fn update_bundle(&self, descriptor: &BundleDescriptor, expected: Version) -> Result<Version> {
        self.update_json(&self.paths.bundle(descriptor.id), descriptor, expected)
            .await
    }

    // ========================================================================
    // Brokers and leader
    // ========================================================================

    pub async fn register_broker(&self, descriptor: &BrokerDescriptor) -> Result<()> {
        self.create_json(
            &self.paths.broker(&descriptor.name),
            descriptor,
            NodeKind::Ephemeral,
        )
        .await
    }

    pub async fn get_broker(&self, name: &str) -> Result<Option<(BrokerDescriptor, Version)>> {
        self.get_json(&self.paths.broker(name)).await
    }

    pub async fn update_broker(&self, descriptor: &BrokerDescriptor, expected: Version) -> Result<Version> {
        self.update_json(&self.paths.broker(&descriptor.name), descriptor, expected)
            .await
    }

    /// Every registered broker. Brokers that vanish mid-listing are skipped.
    pub async fn list_brokers(&self) -> Result<Vec<BrokerDescriptor>> {
        let names = self.store.list_children(self.paths.broker_root()).await?;
        let mut brokers = Vec::with_capacity(names.len());
        for name in names {
            if let Some((broker, _)) = self.get_broker(&name).await? {
                brokers.push(broker);
            }
        }
        Ok(brokers)
    }

    pub async fn get_leader(&self) -> Result<Option<LeaderDescriptor>> {
        Ok(self.get_json(self.paths.leader()).await?.map(|(l, _)| l))
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    /// Block until `path` does not exist.
    ///
    /// Fails with `Timeout` after `timeout` and with `Canceled` when `cancel`
    /// fires. Nothing is registered in the store on behalf of the waiter.
    pub async fn wait_for_removal(
        &self,
        path: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let watch = self.store.watch(path).await?;
            if !watch.exists {
                return Ok(());
            }
            tokio::select! {
                event = watch.events => {
                    match event {
                        Ok(WatchEvent::Deleted) => {
                            debug!(path = %path, "Watched node removed");
                            return Ok(());
                        }
                        // Data changes and dropped watches re-arm.
                        Ok(_) | Err(_) => continue,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Err(Error::Timeout),
                _ = cancel.cancelled() => return Err(Error::Canceled),
            }
        }
    }
}
