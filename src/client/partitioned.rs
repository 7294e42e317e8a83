use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures::future::try_join_all;

use super::{Client, Publisher};
use crate::cluster::hash_key;
use crate::error::{Error, Result};
use crate::types::{ClientRole, Msid, PartitionId, PublishMode};

/// How a [`PartitionedPublisher`] picks a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionRouting {
    /// `crc32(key) % partitions`; keyless messages go round-robin.
    #[default]
    KeyHash,
    RoundRobin,
}

/// One publisher per partition of a topic.
#[derive(Debug)]
pub struct PartitionedPublisher {
    topic: String,
    routing: PartitionRouting,
    publishers: Vec<Publisher>,
    next: AtomicUsize,
}

impl PartitionedPublisher {
    /// Connect to every partition of `topic`.
    ///
    /// A missing topic is created with the client's default partition count.
    pub async fn connect(
        client: &Client,
        topic: &str,
        name: &str,
        mode: PublishMode,
        routing: PartitionRouting,
    ) -> Result<Self> {
        let count = match client.topic_partitions(topic).await {
            Ok(count) => count,
            Err(Error::NotFound(_)) => client.config().default_partition_count,
            Err(e) => return Err(e),
        };
        if count == 0 {
            return Err(Error::InvalidArgument(format!("topic {topic} has no partitions")));
        }

        let publishers = try_join_all((1..=count).map(|partition| {
            Publisher::connect_as(
                client,
                topic,
                partition,
                name,
                mode,
                ClientRole::PartitionPublisher,
            )
        }))
        .await?;

        Ok(Self {
            topic: topic.to_string(),
            routing,
            publishers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_count(&self) -> usize {
        self.publishers.len()
    }

    /// Partition a message with `key` goes to.
    pub fn route(&self, key: Option<&str>) -> PartitionId {
        let n = self.publishers.len();
        let index = match (self.routing, key) {
            (PartitionRouting::KeyHash, Some(key)) => hash_key(key) as usize % n,
            _ => self.next.fetch_add(1, Ordering::Relaxed) % n,
        };
        index as PartitionId + 1
    }

    /// Publish and return `(partition, msid)`.
    pub async fn publish(&self, key: Option<&str>, payload: impl Into<Bytes>) -> Result<(PartitionId, Msid)> {
        let partition = self.route(key);
        let publisher = &self.publishers[partition as usize - 1];
        let msid = publisher
            .publish_with_key(key.map(str::to_string), payload)
            .await?;
        Ok((partition, msid))
    }

    pub async fn close(self) -> Result<()> {
        for publisher in self.publishers {
            publisher.close().await?;
        }
        Ok(())
    }
}
