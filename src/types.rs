//! Domain types shared by the broker, the stores and the client.
//!
//! Descriptors (`*Descriptor`) are the JSON bodies stored in the coordination
//! store; [`Message`] and [`SubscriptionRecord`] live in the log store.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// 1-based partition index within a topic.
pub type PartitionId = u32;

/// Broker-assigned, per-partition message sequence number (starts at 1).
pub type Msid = u64;

/// Client-supplied correlation id.
pub type Mid = i64;

/// How publishers share a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// One lead publisher; others are rejected.
    Exclusive,
    /// One lead publisher; others wait for it to go away.
    WaitExclusive,
    /// Any number of publishers.
    #[default]
    Shared,
}

impl PublishMode {
    pub fn has_lead(&self) -> bool {
        !matches!(self, PublishMode::Shared)
    }
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublishMode::Exclusive => "exclusive",
            PublishMode::WaitExclusive => "wait_exclusive",
            PublishMode::Shared => "shared",
        };
        f.write_str(s)
    }
}

impl FromStr for PublishMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exclusive" => Ok(PublishMode::Exclusive),
            "wait_exclusive" | "waitexclusive" => Ok(PublishMode::WaitExclusive),
            "shared" => Ok(PublishMode::Shared),
            other => Err(Error::InvalidArgument(format!("unknown publish mode '{other}'"))),
        }
    }
}

/// Delivery semantics of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeMode {
    /// One member, no successor queue.
    Exclusive,
    /// One lead member; later joiners wait to take over.
    Failover,
    /// Any number of members; each pull is served to the puller.
    #[default]
    Shared,
    /// Any number of members; each message goes to the member its key selects.
    KeyShared,
}

impl SubscribeMode {
    /// Modes that are guarded by an ephemeral lead node.
    pub fn has_lead(&self) -> bool {
        matches!(self, SubscribeMode::Exclusive | SubscribeMode::Failover)
    }
}

impl fmt::Display for SubscribeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscribeMode::Exclusive => "exclusive",
            SubscribeMode::Failover => "failover",
            SubscribeMode::Shared => "shared",
            SubscribeMode::KeyShared => "key_shared",
        };
        f.write_str(s)
    }
}

impl FromStr for SubscribeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exclusive" => Ok(SubscribeMode::Exclusive),
            "failover" => Ok(SubscribeMode::Failover),
            "shared" => Ok(SubscribeMode::Shared),
            "key_shared" | "keyshared" | "key_shard" => Ok(SubscribeMode::KeyShared),
            other => Err(Error::InvalidArgument(format!("unknown subscribe mode '{other}'"))),
        }
    }
}

/// Which kind of client a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    Publisher,
    PartitionPublisher,
    Subscriber,
}

impl ClientRole {
    pub fn is_publisher(&self) -> bool {
        matches!(self, ClientRole::Publisher | ClientRole::PartitionPublisher)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::Publisher => "publisher",
            ClientRole::PartitionPublisher => "partition-publisher",
            ClientRole::Subscriber => "subscriber",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub partition: PartitionId,
    pub msid: Msid,
    pub mid: Mid,
    /// Routing key for key-shared subscriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub payload: Bytes,
}

impl Message {
    /// Key used by key-shared routing; falls back to the correlation id.
    pub fn routing_key(&self) -> String {
        match &self.key {
            Some(k) => k.clone(),
            None => self.mid.to_string(),
        }
    }
}

/// A message pushed to a subscriber, tagged with the subscription it was
/// delivered under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub subscription: String,
    pub message: Message,
}

/// Topic descriptor stored at `<topics>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDescriptor {
    pub name: String,
    pub partition_count: u32,
    pub publish_mode: PublishMode,
}

/// Partition descriptor stored at `<topics>/<topic>/p<N>`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub topic: String,
    pub partition: PartitionId,
    pub message_count: Msid,
    pub push_offset: Msid,
    pub ack_offset: Msid,
    /// Broker currently serving the partition.
    #[serde(default)]
    pub owner_url: Option<String>,
}

/// Subscription descriptor stored at `.../p<N>/subscription/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDescriptor {
    pub name: String,
    pub topic: String,
    pub partition: PartitionId,
    pub mode: SubscribeMode,
    /// Full names of currently attached members.
    #[serde(default)]
    pub members: Vec<String>,
}

/// Per-subscription cursors, persisted in the log store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub mode: SubscribeMode,
    /// Next msid to deliver.
    pub push_offset: Msid,
    /// Highest msid acknowledged.
    pub ack_offset: Msid,
}

/// Bundle descriptor stored at `<bundles>/bundle<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDescriptor {
    pub id: u32,
    pub start: u32,
    pub end: u32,
    #[serde(default)]
    pub owner_url: Option<String>,
}

/// Resource usage snapshot reported by a broker.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU utilization in `[0, 1]`.
    pub cpu: f64,
    /// Memory utilization in `[0, 1]`.
    pub memory: f64,
    /// Inbound bandwidth utilization in `[0, 1]`.
    pub bandwidth_in: f64,
    /// Outbound bandwidth utilization in `[0, 1]`.
    pub bandwidth_out: f64,
}

impl ResourceUsage {
    /// Load index: the most saturated resource.
    pub fn load_index(&self) -> f64 {
        [self.cpu, self.memory, self.bandwidth_in, self.bandwidth_out]
            .into_iter()
            .fold(0.0_f64, f64::max)
    }
}

/// Broker registration stored (ephemeral) at `<brokers>/<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub usage: ResourceUsage,
    #[serde(default)]
    pub load_index: f64,
}

impl BrokerDescriptor {
    pub fn url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Cluster leader node body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderDescriptor {
    pub name: String,
    pub url: String,
    /// Unique per election win.
    #[serde(default)]
    pub term: String,
}

/// Body of a lead-publisher or lead-subscriber lease node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseHolder {
    /// Full name of the holding client.
    pub holder: String,
    /// Unique per acquisition; release only deletes a node carrying this token.
    pub token: String,
    pub acquired_at_ms: i64,
}
