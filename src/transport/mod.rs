//! Transport seams.
//!
//! The broker never talks to a socket directly. It sees clients through
//! [`ClientLink`] (deliver a message, check liveness) and clients see brokers
//! through [`BrokerService`]. Two implementations exist:
//!
//! - [`local::LocalNetwork`]: in-process, with fault injection, used by tests
//!   and embedded setups.
//! - [`tcp`]: length-prefixed JSON frames over TCP (framing in [`codec`]),
//!   served by [`crate::server::RpcServer`].

pub mod codec;
pub mod local;
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::protocol::{
    AckRequest, BrokerRequest, BrokerResponse, ConnectRequest, PublishRequest, PullReply,
    PullRequest, SubscribeRequest, UnsubscribeRequest,
};
use crate::types::{Delivery, Msid, PartitionId};

/// The broker's handle on a connected client.
#[async_trait]
pub trait ClientLink: Send + Sync {
    /// Address the client reported for itself.
    fn url(&self) -> &str;

    /// Push one message.
    async fn deliver(&self, delivery: Delivery) -> Result<()>;

    /// Liveness check.
    async fn alive_check(&self) -> Result<()>;
}

/// Client to broker RPC surface.
#[async_trait]
pub trait BrokerService: Send + Sync {
    /// URL of the broker owning `(topic, partition)`, or `NeedAllocation`.
    async fn lookup(&self, topic: &str, partition: PartitionId) -> Result<String>;

    /// Ask the cluster leader to allocate the bundle of `(topic, partition)`.
    async fn request_alloc(&self, topic: &str, partition: PartitionId) -> Result<String>;

    /// Returns the broker-assigned full name.
    async fn connect(&self, request: ConnectRequest) -> Result<String>;

    async fn publish(&self, request: PublishRequest) -> Result<Msid>;

    async fn subscribe(&self, request: SubscribeRequest) -> Result<()>;

    /// Messages arrive through [`ClientLink::deliver`] while the pull runs.
    async fn pull(&self, request: PullRequest) -> Result<PullReply>;

    async fn ack(&self, request: AckRequest) -> Result<()>;

    async fn unsubscribe(&self, request: UnsubscribeRequest) -> Result<()>;

    /// Partition count of `topic`.
    async fn get_topic_info(&self, topic: &str) -> Result<u32>;

    async fn disconnect(&self, name: &str) -> Result<()>;
}

/// Opens connections to brokers.
///
/// `endpoint` receives the broker's calls back to this client for the
/// lifetime of the connection.
#[async_trait]
pub trait BrokerDialer: Send + Sync {
    async fn dial(&self, url: &str, endpoint: Arc<dyn ClientLink>) -> Result<Arc<dyn BrokerService>>;
}

/// A raw request/response channel to one broker.
///
/// Every channel is a [`BrokerService`]: the typed calls are built on top of
/// [`RequestChannel::call`].
#[async_trait]
pub trait RequestChannel: Send + Sync {
    /// Send one request. A `BrokerResponse::Error` is returned as `Ok`; the
    /// typed layer turns it into an [`Error`].
    async fn call(&self, request: BrokerRequest) -> Result<BrokerResponse>;
}

fn unexpected(op: &str, response: BrokerResponse) -> Error {
    match response {
        BrokerResponse::Error(e) => e.into_error(),
        other => Error::Transport(format!("unexpected {op} response: {other:?}")),
    }
}

#[async_trait]
impl<C: RequestChannel> BrokerService for C {
    async fn lookup(&self, topic: &str, partition: PartitionId) -> Result<String> {
        let request = BrokerRequest::Lookup {
            topic: topic.to_string(),
            partition,
        };
        match self.call(request).await? {
            BrokerResponse::Url(url) => Ok(url),
            other => Err(unexpected("lookup", other)),
        }
    }

    async fn request_alloc(&self, topic: &str, partition: PartitionId) -> Result<String> {
        let request = BrokerRequest::RequestAlloc {
            topic: topic.to_string(),
            partition,
        };
        match self.call(request).await? {
            BrokerResponse::Url(url) => Ok(url),
            other => Err(unexpected("request_alloc", other)),
        }
    }

    async fn connect(&self, request: ConnectRequest) -> Result<String> {
        match self.call(BrokerRequest::Connect(request)).await? {
            BrokerResponse::Name(name) => Ok(name),
            other => Err(unexpected("connect", other)),
        }
    }

    async fn publish(&self, request: PublishRequest) -> Result<Msid> {
        match self.call(BrokerRequest::Publish(request)).await? {
            BrokerResponse::Msid(msid) => Ok(msid),
            other => Err(unexpected("publish", other)),
        }
    }

    async fn subscribe(&self, request: SubscribeRequest) -> Result<()> {
        match self.call(BrokerRequest::Subscribe(request)).await? {
            BrokerResponse::Ok => Ok(()),
            other => Err(unexpected("subscribe", other)),
        }
    }

    async fn pull(&self, request: PullRequest) -> Result<PullReply> {
        match self.call(BrokerRequest::Pull(request)).await? {
            BrokerResponse::Pulled(reply) => Ok(reply),
            other => Err(unexpected("pull", other)),
        }
    }

    async fn ack(&self, request: AckRequest) -> Result<()> {
        match self.call(BrokerRequest::Ack(request)).await? {
            BrokerResponse::Ok => Ok(()),
            other => Err(unexpected("ack", other)),
        }
    }

    async fn unsubscribe(&self, request: UnsubscribeRequest) -> Result<()> {
        match self.call(BrokerRequest::Unsubscribe(request)).await? {
            BrokerResponse::Ok => Ok(()),
            other => Err(unexpected("unsubscribe", other)),
        }
    }

    async fn get_topic_info(&self, topic: &str) -> Result<u32> {
        let request = BrokerRequest::GetTopicInfo {
            topic: topic.to_string(),
        };
        match self.call(request).await? {
            BrokerResponse::PartitionCount(count) => Ok(count),
            other => Err(unexpected("get_topic_info", other)),
        }
    }

    async fn disconnect(&self, name: &str) -> Result<()> {
        let request = BrokerRequest::Disconnect {
            name: name.to_string(),
        };
        match self.call(request).await? {
            BrokerResponse::Ok => Ok(()),
            other => Err(unexpected("disconnect", other)),
        }
    }
}
