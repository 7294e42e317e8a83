//! Path and key layout for both stores.
//!
//! # Coordination store
//!
//! ```text
//! <broker_root>/<broker>                                  ephemeral  BrokerDescriptor
//! <topic_root>/<topic>                                    persistent TopicDescriptor
//! <topic_root>/<topic>/p<N>                               persistent PartitionDescriptor
//! <topic_root>/<topic>/p<N>/puber/leader                  ephemeral  LeaseHolder
//! <topic_root>/<topic>/p<N>/puber/<client>                persistent (shared publishers)
//! <topic_root>/<topic>/p<N>/subscription/<sub>            persistent SubscriptionDescriptor
//! <topic_root>/<topic>/p<N>/subscription/<sub>/leader     ephemeral  LeaseHolder
//! <topic_root>/<topic>/p<N>/subscription/<sub>/<client>   persistent (shared members)
//! <bundle_root>/bundle<id>                                persistent BundleDescriptor
//! <leader_path>                                           ephemeral  LeaderDescriptor
//! ```
//!
//! # Log store
//!
//! ```text
//! <topic>/p<N>/<msid>   Message
//! <topic>/p<N>/<sub>    SubscriptionRecord
//! ```
//!
//! Message and cursor keys share a namespace, which is why subscription names
//! may not be purely numeric (see [`super::validation`]).

use super::config::CoordinationConfig;
use crate::types::{Msid, PartitionId};

/// Name of the lead node under a publisher or subscription path.
pub const LEADER_NODE: &str = "leader";

/// Builds coordination-store paths from the configured roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    broker_root: String,
    topic_root: String,
    bundle_root: String,
    leader_path: String,
}

impl Default for StorePaths {
    fn default() -> Self {
        Self::from_config(&CoordinationConfig::default())
    }
}

impl StorePaths {
    pub fn from_config(config: &CoordinationConfig) -> Self {
        Self {
            broker_root: trim_root(&config.broker_root),
            topic_root: trim_root(&config.topic_root),
            bundle_root: trim_root(&config.bundle_root),
            leader_path: config.leader_path.clone(),
        }
    }

    pub fn broker_root(&self) -> &str {
        &self.broker_root
    }

    pub fn broker(&self, name: &str) -> String {
        format!("{}/{}", self.broker_root, name)
    }

    pub fn topic_root(&self) -> &str {
        &self.topic_root
    }

    pub fn topic(&self, topic: &str) -> String {
        format!("{}/{}", self.topic_root, topic)
    }

    pub fn partition(&self, topic: &str, partition: PartitionId) -> String {
        format!("{}/{}/p{}", self.topic_root, topic, partition)
    }

    pub fn publisher_root(&self, topic: &str, partition: PartitionId) -> String {
        format!("{}/puber", self.partition(topic, partition))
    }

    pub fn publisher_leader(&self, topic: &str, partition: PartitionId) -> String {
        format!("{}/{}", self.publisher_root(topic, partition), LEADER_NODE)
    }

    pub fn publisher(&self, topic: &str, partition: PartitionId, client: &str) -> String {
        format!("{}/{}", self.publisher_root(topic, partition), client)
    }

    pub fn subscription(&self, topic: &str, partition: PartitionId, sub: &str) -> String {
        format!("{}/subscription/{}", self.partition(topic, partition), sub)
    }

    pub fn subscription_leader(&self, topic: &str, partition: PartitionId, sub: &str) -> String {
        format!("{}/{}", self.subscription(topic, partition, sub), LEADER_NODE)
    }

    pub fn subscription_member(
        &self,
        topic: &str,
        partition: PartitionId,
        sub: &str,
        client: &str,
    ) -> String {
        format!("{}/{}", self.subscription(topic, partition, sub), client)
    }

    pub fn bundle_root(&self) -> &str {
        &self.bundle_root
    }

    pub fn bundle(&self, id: u32) -> String {
        format!("{}/bundle{}", self.bundle_root, id)
    }

    pub fn leader(&self) -> &str {
        &self.leader_path
    }
}

fn trim_root(root: &str) -> String {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Input to the bundle hash for a partition.
pub fn routing_key(topic: &str, partition: PartitionId) -> String {
    format!("/{topic}/p{partition}")
}

/// Log-store key of a message body.
pub fn message_key(topic: &str, partition: PartitionId, msid: Msid) -> String {
    format!("{topic}/p{partition}/{msid}")
}

/// Log-store key of a subscription cursor record.
pub fn subscription_record_key(topic: &str, partition: PartitionId, sub: &str) -> String {
    format!("{topic}/p{partition}/{sub}")
}
