//! Bundle lookup and allocation.

use tracing::{debug, info};

use super::Broker;
use crate::cluster::leader::rank_brokers;
use crate::cluster::validation::validate_topic_name;
use crate::error::{Error, Result};
use crate::types::PartitionId;

impl Broker {
    /// Owner URL of `(topic, partition)`.
    ///
    /// Fails with `NeedAllocation` carrying the leader URL when the bundle has
    /// no owner yet.
    pub async fn lookup(&self, topic: &str, partition: PartitionId) -> Result<String> {
        validate_topic_name(topic)?;
        let (bundle, owner) = self.router.resolve(topic, partition).await?;
        match owner {
            Some(url) => Ok(url),
            None => {
                let leader_url = self.election.leader_url().await?;
                debug!(topic, partition, bundle, %leader_url, "Bundle unowned");
                Err(Error::NeedAllocation { leader_url })
            }
        }
    }

    /// Assign the bundle of `(topic, partition)` to the least loaded broker.
    ///
    /// Only the cluster leader allocates; other brokers redirect with
    /// `NeedAllocation`.
    pub async fn request_alloc(&self, topic: &str, partition: PartitionId) -> Result<String> {
        validate_topic_name(topic)?;
        if !self.election.is_leader().await {
            return Err(Error::NeedAllocation {
                leader_url: self.election.leader_url().await?,
            });
        }

        let (bundle, owner) = self.router.resolve(topic, partition).await?;
        if let Some(url) = owner {
            return Ok(url);
        }

        let ranked = rank_brokers(self.metadata.list_brokers().await?);
        let target = ranked
            .first()
            .ok_or_else(|| Error::NotFound("no registered brokers".to_string()))?;
        let owner = self.router.assign(bundle, &target.url()).await?;
        info!(topic, partition, bundle, owner = %owner, "Bundle allocated");
        Ok(owner)
    }

    pub async fn get_topic_info(&self, topic: &str) -> Result<u32> {
        validate_topic_name(topic)?;
        self.metadata
            .get_topic(topic)
            .await?
            .map(|t| t.partition_count)
            .ok_or_else(|| Error::NotFound(format!("topic {topic}")))
    }

    /// Fail unless this broker owns the bundle of `(topic, partition)`.
    pub(crate) async fn ensure_owned(&self, topic: &str, partition: PartitionId) -> Result<()> {
        let (bundle, owner) = self.router.resolve(topic, partition).await?;
        match owner {
            Some(url) if url == self.url => Ok(()),
            Some(url) => {
                // The cached owner may be stale; the next lookup re-reads it.
                self.router.invalidate(bundle);
                Err(Error::AlreadyOwned(url))
            }
            None => Err(Error::NeedAllocation {
                leader_url: self.election.leader_url().await?,
            }),
        }
    }
}
